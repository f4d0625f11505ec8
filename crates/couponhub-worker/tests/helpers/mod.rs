//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use couponhub_cache::Backends;
use couponhub_cache::memory::MemoryMessageBus;
use couponhub_core::config::{
    LockConfig, LockStrategyKind, MessageBusConfig, OutboxConfig, RetryConfig, WorkerConfig,
};
use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_core::traits::{BusMessage, BusSubscription, MessageBus, QuotaCounter};
use couponhub_database::{CouponRepository, MemoryDatabase};
use couponhub_entity::coupon::{Coupon, DiscountRule};
use couponhub_entity::user_coupon::UserCoupon;
use couponhub_lock::{LockManager, LockOptions, OptimisticRetry};
use couponhub_service::{CouponIssuanceService, ReservationService};
use couponhub_worker::{OutboxPublisher, ReservationConsumer};

/// Code of the coupon every fixture creates.
pub const COUPON_CODE: &str = "WELCOME";

/// Test application context wiring the services to the worker.
pub struct TestApp {
    /// In-memory database holding every table.
    pub db: Arc<MemoryDatabase>,
    /// In-memory bus, kept concrete so tests can inspect it.
    pub bus: Arc<MemoryMessageBus>,
    /// Store and quota counter.
    pub backends: Backends,
    /// The coupon under test.
    pub coupon: Coupon,
    /// Reservation service the consumer confirms through.
    pub reservations: Arc<ReservationService>,
    /// Lock strategy guarding issuance.
    pub lock: LockManager,
}

impl TestApp {
    /// A coupon with `total` units.
    pub async fn new(total: i32) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let now = Utc::now();
        let coupon = Coupon::new(
            COUPON_CODE,
            "Welcome offer",
            DiscountRule::Percentage(10),
            total,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::days(7),
        )
        .expect("valid coupon");
        db.insert_coupon(&coupon).await.expect("insert coupon");

        let bus = Arc::new(MemoryMessageBus::new());
        let mut backends = Backends::in_memory(Duration::from_secs(60), 3);
        backends.bus = bus.clone();

        let lock = LockManager::new(
            LockStrategyKind::Spin,
            &lock_config(),
            &retry_config(),
            &backends,
        );
        let reservations = Arc::new(build_reservations(
            db.clone(),
            db.clone(),
            &backends,
            lock.clone(),
        ));

        Self {
            db,
            bus,
            backends,
            coupon,
            reservations,
            lock,
        }
    }

    /// Issuance service sharing the reservation pipeline's lock.
    pub fn issuance(&self) -> CouponIssuanceService {
        build_issuance(self.db.clone(), &self.backends, self.lock.clone())
    }

    /// Reservation service issuing through a custom coupon repository.
    pub fn reservations_with(&self, coupons: Arc<dyn CouponRepository>) -> Arc<ReservationService> {
        Arc::new(build_reservations(
            coupons,
            self.db.clone(),
            &self.backends,
            self.lock.clone(),
        ))
    }

    /// Remaining units on the quota counter.
    pub async fn quota_remaining(&self) -> Option<i64> {
        self.backends
            .quota
            .remaining(self.coupon.id)
            .await
            .expect("read quota")
    }

    /// Publisher over the in-memory bus.
    pub fn publisher(&self) -> OutboxPublisher {
        self.publisher_with(self.bus.clone())
    }

    /// Publisher over a custom bus.
    pub fn publisher_with(&self, bus: Arc<dyn MessageBus>) -> OutboxPublisher {
        OutboxPublisher::new(self.db.clone(), bus, OutboxConfig::default())
    }

    /// Consumer on the in-memory bus that blocks briefly per poll.
    pub fn consumer(&self) -> ReservationConsumer {
        self.consumer_with(Arc::clone(&self.reservations))
    }

    /// Consumer confirming through a custom reservation service.
    pub fn consumer_with(&self, reservations: Arc<ReservationService>) -> ReservationConsumer {
        let bus_config = MessageBusConfig {
            block_ms: 50,
            ..MessageBusConfig::default()
        };
        let worker = WorkerConfig {
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        };
        ReservationConsumer::new(
            self.bus.clone(),
            reservations,
            &OutboxConfig::default(),
            &bus_config,
            &worker,
        )
    }
}

fn lock_config() -> LockConfig {
    LockConfig {
        retry_interval_ms: 2,
        ..LockConfig::default()
    }
}

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        base_delay_ms: 1,
    }
}

fn build_reservations(
    coupons: Arc<dyn CouponRepository>,
    db: Arc<MemoryDatabase>,
    backends: &Backends,
    lock: LockManager,
) -> ReservationService {
    let issuance = Arc::new(build_issuance(coupons.clone(), backends, lock));
    ReservationService::new(coupons, db, backends.quota.clone(), issuance)
}

fn build_issuance(
    coupons: Arc<dyn CouponRepository>,
    backends: &Backends,
    lock: LockManager,
) -> CouponIssuanceService {
    CouponIssuanceService::new(
        coupons,
        backends.quota.clone(),
        lock,
        LockOptions::from_config(&lock_config()),
        OptimisticRetry::from_config(&retry_config()),
    )
}

/// Coupon repository whose issuance writes always fail with a database
/// error, as if the primary were down.
#[derive(Debug)]
pub struct UnavailableWrites(pub Arc<MemoryDatabase>);

#[async_trait]
impl CouponRepository for UnavailableWrites {
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<()> {
        self.0.insert_coupon(coupon).await
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        self.0.find_coupon(id).await
    }

    async fn find_coupon_by_code(&self, code: &str) -> AppResult<Option<Coupon>> {
        self.0.find_coupon_by_code(code).await
    }

    async fn find_user_coupon(&self, id: Uuid) -> AppResult<Option<UserCoupon>> {
        self.0.find_user_coupon(id).await
    }

    async fn find_user_coupon_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<UserCoupon>> {
        self.0.find_user_coupon_by_key(idempotency_key).await
    }

    async fn has_active_user_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        self.0.has_active_user_coupon(coupon_id, user_id).await
    }

    async fn save_issuance(
        &self,
        _coupon: &Coupon,
        _user_coupon: &UserCoupon,
        _fencing_token: Option<i64>,
    ) -> AppResult<()> {
        Err(AppError::database("connection refused"))
    }

    async fn save_cancellation(&self, coupon: &Coupon, user_coupon: &UserCoupon) -> AppResult<()> {
        self.0.save_cancellation(coupon, user_coupon).await
    }

    async fn update_user_coupon(&self, user_coupon: &UserCoupon) -> AppResult<()> {
        self.0.update_user_coupon(user_coupon).await
    }
}

/// Bus that fails the first `failures` publishes, then delegates.
#[derive(Debug)]
pub struct FlakyBus {
    inner: Arc<MemoryMessageBus>,
    remaining_failures: AtomicU32,
}

impl FlakyBus {
    /// Fail the next `failures` publishes.
    pub fn new(inner: Arc<MemoryMessageBus>, failures: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> AppResult<()> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::message_bus("broker unavailable"));
        }
        self.inner.publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AppResult<Box<dyn BusSubscription>> {
        self.inner.subscribe(topic, group, consumer).await
    }
}
