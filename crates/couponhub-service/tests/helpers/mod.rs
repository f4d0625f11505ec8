//! Shared fixtures for the service integration tests.
//!
//! Everything runs on the in-memory backends, so tests are isolated and
//! can run in parallel.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use couponhub_cache::Backends;
use couponhub_core::config::{LockConfig, LockStrategyKind, RetryConfig};
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::QuotaCounter;
use couponhub_database::{CouponRepository, MemoryDatabase};
use couponhub_entity::coupon::{Coupon, DiscountRule};
use couponhub_entity::user_coupon::UserCoupon;
use couponhub_lock::{LockManager, LockOptions, OptimisticRetry};
use couponhub_service::{
    CouponIssuanceService, CouponRecoveryService, QuotaReconciler, ReservationService,
};

/// Code of the coupon every fixture creates.
pub const COUPON_CODE: &str = "LIMITED";

/// Test application context.
pub struct TestApp {
    /// In-memory database holding every table.
    pub db: Arc<MemoryDatabase>,
    /// Store, quota counter, bus and quorum nodes.
    pub backends: Backends,
    /// The coupon under test.
    pub coupon: Coupon,
    /// Lock strategy used by the services.
    pub lock: LockManager,
}

impl TestApp {
    /// A coupon with `total` units, guarded by `strategy`.
    pub async fn new(total: i32, strategy: LockStrategyKind) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let now = Utc::now();
        let coupon = Coupon::new(
            COUPON_CODE,
            "Limited edition",
            DiscountRule::Fixed(1_000),
            total,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::days(30),
        )
        .expect("valid coupon");
        db.insert_coupon(&coupon).await.expect("insert coupon");

        let backends = Backends::in_memory(Duration::from_secs(60), 3);
        let lock = LockManager::new(strategy, &lock_config(), &retry_config(), &backends);

        Self {
            db,
            backends,
            coupon,
            lock,
        }
    }

    /// Issuance service over the in-memory database.
    pub fn issuance(&self) -> CouponIssuanceService {
        self.issuance_with(self.db.clone())
    }

    /// Issuance service over a custom coupon repository.
    pub fn issuance_with(&self, coupons: Arc<dyn CouponRepository>) -> CouponIssuanceService {
        CouponIssuanceService::new(
            coupons,
            self.backends.quota.clone(),
            self.lock.clone(),
            lock_options(),
            OptimisticRetry::from_config(&retry_config()),
        )
    }

    /// Reservation service.
    pub fn reservations(&self) -> ReservationService {
        ReservationService::new(
            self.db.clone(),
            self.db.clone(),
            self.backends.quota.clone(),
            Arc::new(self.issuance()),
        )
    }

    /// Recovery service.
    pub fn recovery(&self) -> CouponRecoveryService {
        CouponRecoveryService::new(
            self.db.clone(),
            self.backends.quota.clone(),
            self.lock.clone(),
            lock_options(),
        )
    }

    /// Quota reconciler.
    pub fn reconciler(&self) -> QuotaReconciler {
        QuotaReconciler::new(self.db.clone(), self.db.clone(), self.backends.quota.clone())
    }

    /// `used_count` currently persisted for the coupon.
    pub async fn used_count(&self) -> i32 {
        self.db
            .find_coupon(self.coupon.id)
            .await
            .expect("find coupon")
            .expect("coupon exists")
            .used_count()
    }

    /// Remaining units on the quota counter.
    pub async fn quota_remaining(&self) -> Option<i64> {
        self.backends
            .quota
            .remaining(self.coupon.id)
            .await
            .expect("read quota")
    }
}

pub fn lock_config() -> LockConfig {
    LockConfig {
        ttl_ms: 2_000,
        wait_timeout_ms: 5_000,
        retry_interval_ms: 2,
        node_timeout_ms: 20,
        ..LockConfig::default()
    }
}

pub fn retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 10,
        base_delay_ms: 1,
    }
}

pub fn lock_options() -> LockOptions {
    LockOptions::from_config(&lock_config())
}

/// Coupon repository that fails `save_issuance` with scripted errors
/// before delegating to the in-memory database.
#[derive(Debug)]
pub struct ScriptedFailures {
    inner: Arc<MemoryDatabase>,
    failures: Mutex<VecDeque<AppError>>,
    /// Calls to `save_issuance`, failed or not.
    pub save_attempts: AtomicU32,
}

impl ScriptedFailures {
    /// Fail the next `save_issuance` calls with `failures`, in order.
    pub fn new(inner: Arc<MemoryDatabase>, failures: Vec<AppError>) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures.into()),
            save_attempts: AtomicU32::new(0),
        }
    }

    /// Number of `save_issuance` calls so far.
    pub fn attempts(&self) -> u32 {
        self.save_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CouponRepository for ScriptedFailures {
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<()> {
        self.inner.insert_coupon(coupon).await
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        self.inner.find_coupon(id).await
    }

    async fn find_coupon_by_code(&self, code: &str) -> AppResult<Option<Coupon>> {
        self.inner.find_coupon_by_code(code).await
    }

    async fn find_user_coupon(&self, id: Uuid) -> AppResult<Option<UserCoupon>> {
        self.inner.find_user_coupon(id).await
    }

    async fn find_user_coupon_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<UserCoupon>> {
        self.inner.find_user_coupon_by_key(idempotency_key).await
    }

    async fn has_active_user_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        self.inner.has_active_user_coupon(coupon_id, user_id).await
    }

    async fn save_issuance(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
        fencing_token: Option<i64>,
    ) -> AppResult<()> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.failures.lock().expect("failures lock").pop_front();
        match scripted {
            Some(error) => Err(error),
            None => {
                self.inner
                    .save_issuance(coupon, user_coupon, fencing_token)
                    .await
            }
        }
    }

    async fn save_cancellation(&self, coupon: &Coupon, user_coupon: &UserCoupon) -> AppResult<()> {
        self.inner.save_cancellation(coupon, user_coupon).await
    }

    async fn update_user_coupon(&self, user_coupon: &UserCoupon) -> AppResult<()> {
        self.inner.update_user_coupon(user_coupon).await
    }
}
