//! In-memory database implementing every persistence port.
//!
//! One mutex guards all tables, so each port method behaves like a
//! serializable transaction: the version, fencing and uniqueness checks
//! and the writes they guard happen under the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use couponhub_core::error::AppError;
use couponhub_core::result::AppResult;
use couponhub_entity::coupon::Coupon;
use couponhub_entity::outbox::{OutboxEvent, OutboxStatus};
use couponhub_entity::reservation::{CouponReservation, ReservationStatus};
use couponhub_entity::user_coupon::UserCoupon;

use crate::repositories::{
    CouponRepository, OutboxRepository, OutboxStats, ReservationRepository,
};

#[derive(Debug)]
struct StoredCoupon {
    coupon: Coupon,
    fencing_token: i64,
}

#[derive(Debug, Default)]
struct Tables {
    coupons: HashMap<Uuid, StoredCoupon>,
    user_coupons: HashMap<Uuid, UserCoupon>,
    reservations: HashMap<Uuid, CouponReservation>,
    /// Insertion order doubles as creation order.
    outbox: Vec<OutboxEvent>,
}

impl Tables {
    fn check_counters(&self, coupon: &Coupon, fencing_token: Option<i64>) -> AppResult<()> {
        let stored = self
            .coupons
            .get(&coupon.id)
            .ok_or_else(|| AppError::not_found(format!("Coupon {} not found", coupon.id)))?;

        if let Some(token) = fencing_token {
            if stored.fencing_token > token {
                return Err(AppError::fencing_violation(token, stored.fencing_token));
            }
        }
        if stored.coupon.version() != coupon.version() {
            return Err(AppError::optimistic_lock(format!(
                "Coupon {} was modified concurrently (expected version {}, found {})",
                coupon.id,
                coupon.version(),
                stored.coupon.version()
            )));
        }
        Ok(())
    }

    fn write_counters(&mut self, coupon: &Coupon, fencing_token: Option<i64>) {
        let mut next = coupon.clone();
        next.bump_version();
        if let Some(stored) = self.coupons.get_mut(&coupon.id) {
            stored.coupon = next;
            if let Some(token) = fencing_token {
                stored.fencing_token = stored.fencing_token.max(token);
            }
        }
    }

    fn reservation_mut(&mut self, id: Uuid) -> AppResult<&mut CouponReservation> {
        self.reservations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found(format!("Reservation {id} not found")))
    }

    fn outbox_event_mut(&mut self, id: Uuid) -> AppResult<&mut OutboxEvent> {
        self.outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::not_found(format!("Outbox event {id} not found")))
    }
}

/// In-memory implementation of [`CouponRepository`],
/// [`ReservationRepository`] and [`OutboxRepository`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::internal("In-memory database lock poisoned"))
    }

    /// Every user coupon issued from `coupon_id`, in no particular order.
    pub fn user_coupons_of(&self, coupon_id: Uuid) -> AppResult<Vec<UserCoupon>> {
        Ok(self
            .tables()?
            .user_coupons
            .values()
            .filter(|uc| uc.coupon_id == coupon_id)
            .cloned()
            .collect())
    }

    /// Every outbox event, oldest first.
    pub fn outbox_events(&self) -> AppResult<Vec<OutboxEvent>> {
        Ok(self.tables()?.outbox.clone())
    }
}

#[async_trait]
impl CouponRepository for MemoryDatabase {
    async fn insert_coupon(&self, coupon: &Coupon) -> AppResult<()> {
        let mut tables = self.tables()?;
        if tables.coupons.contains_key(&coupon.id)
            || tables.coupons.values().any(|s| s.coupon.code == coupon.code)
        {
            return Err(AppError::conflict(format!(
                "Coupon '{}' already exists",
                coupon.code
            )));
        }
        tables.coupons.insert(
            coupon.id,
            StoredCoupon {
                coupon: coupon.clone(),
                fencing_token: 0,
            },
        );
        Ok(())
    }

    async fn find_coupon(&self, id: Uuid) -> AppResult<Option<Coupon>> {
        Ok(self.tables()?.coupons.get(&id).map(|s| s.coupon.clone()))
    }

    async fn find_coupon_by_code(&self, code: &str) -> AppResult<Option<Coupon>> {
        Ok(self
            .tables()?
            .coupons
            .values()
            .find(|s| s.coupon.code == code)
            .map(|s| s.coupon.clone()))
    }

    async fn find_user_coupon(&self, id: Uuid) -> AppResult<Option<UserCoupon>> {
        Ok(self.tables()?.user_coupons.get(&id).cloned())
    }

    async fn find_user_coupon_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<UserCoupon>> {
        Ok(self
            .tables()?
            .user_coupons
            .values()
            .find(|uc| uc.issued_idempotency_key == idempotency_key)
            .cloned())
    }

    async fn has_active_user_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        Ok(self
            .tables()?
            .user_coupons
            .values()
            .any(|uc| uc.coupon_id == coupon_id && uc.user_id == user_id && uc.is_active()))
    }

    async fn save_issuance(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
        fencing_token: Option<i64>,
    ) -> AppResult<()> {
        let mut tables = self.tables()?;
        tables.check_counters(coupon, fencing_token)?;

        if tables
            .user_coupons
            .values()
            .any(|uc| uc.issued_idempotency_key == user_coupon.issued_idempotency_key)
        {
            return Err(AppError::conflict(format!(
                "Idempotency key '{}' was already used",
                user_coupon.issued_idempotency_key
            )));
        }
        if tables.user_coupons.values().any(|uc| {
            uc.coupon_id == user_coupon.coupon_id && uc.user_id == user_coupon.user_id && uc.is_active()
        }) {
            return Err(AppError::conflict(format!(
                "User {} already holds coupon {}",
                user_coupon.user_id, user_coupon.coupon_id
            )));
        }

        tables.write_counters(coupon, fencing_token);
        tables
            .user_coupons
            .insert(user_coupon.id, user_coupon.clone());
        Ok(())
    }

    async fn save_cancellation(
        &self,
        coupon: &Coupon,
        user_coupon: &UserCoupon,
    ) -> AppResult<()> {
        let mut tables = self.tables()?;
        tables.check_counters(coupon, None)?;

        let stored = tables.user_coupons.get(&user_coupon.id).ok_or_else(|| {
            AppError::not_found(format!("User coupon {} not found", user_coupon.id))
        })?;
        if !stored.is_active() {
            return Err(AppError::conflict(format!(
                "User coupon {} is already cancelled",
                user_coupon.id
            )));
        }

        tables.write_counters(coupon, None);
        tables
            .user_coupons
            .insert(user_coupon.id, user_coupon.clone());
        Ok(())
    }

    async fn update_user_coupon(&self, user_coupon: &UserCoupon) -> AppResult<()> {
        let mut tables = self.tables()?;
        match tables.user_coupons.get_mut(&user_coupon.id) {
            Some(stored) => {
                *stored = user_coupon.clone();
                Ok(())
            }
            None => Err(AppError::not_found(format!(
                "User coupon {} not found",
                user_coupon.id
            ))),
        }
    }
}

#[async_trait]
impl ReservationRepository for MemoryDatabase {
    async fn create_with_outbox(
        &self,
        reservation: &CouponReservation,
        event: &OutboxEvent,
    ) -> AppResult<()> {
        let mut tables = self.tables()?;
        if tables
            .reservations
            .values()
            .any(|r| r.idempotency_key == reservation.idempotency_key)
        {
            return Err(AppError::conflict(format!(
                "Reservation with idempotency key '{}' already exists",
                reservation.idempotency_key
            )));
        }
        if tables.reservations.values().any(|r| {
            r.coupon_id == reservation.coupon_id
                && r.user_id == reservation.user_id
                && r.status == ReservationStatus::Pending
        }) {
            return Err(AppError::conflict(format!(
                "User {} already has a pending reservation of coupon {}",
                reservation.user_id, reservation.coupon_id
            )));
        }
        tables
            .reservations
            .insert(reservation.id, reservation.clone());
        tables.outbox.push(event.clone());
        Ok(())
    }

    async fn find_reservation(&self, id: Uuid) -> AppResult<Option<CouponReservation>> {
        Ok(self.tables()?.reservations.get(&id).cloned())
    }

    async fn find_reservation_by_key(
        &self,
        idempotency_key: &str,
    ) -> AppResult<Option<CouponReservation>> {
        Ok(self
            .tables()?
            .reservations
            .values()
            .find(|r| r.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn has_pending_reservation(&self, coupon_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        Ok(self.tables()?.reservations.values().any(|r| {
            r.coupon_id == coupon_id && r.user_id == user_id && r.status == ReservationStatus::Pending
        }))
    }

    async fn mark_confirmed(&self, id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.reservation_mut(id)?.confirm(now))
    }

    async fn fail_reservation(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.reservation_mut(id)?.fail(reason, now))
    }

    async fn count_pending(&self, coupon_id: Uuid) -> AppResult<i64> {
        Ok(self
            .tables()?
            .reservations
            .values()
            .filter(|r| r.coupon_id == coupon_id && r.status == ReservationStatus::Pending)
            .count() as i64)
    }
}

#[async_trait]
impl OutboxRepository for MemoryDatabase {
    async fn fetch_new(&self, limit: u32) -> AppResult<Vec<OutboxEvent>> {
        Ok(self
            .tables()?
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::New)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn claim(&self, id: Uuid) -> AppResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.outbox_event_mut(id)?.claim(Utc::now()))
    }

    async fn mark_published(&self, id: Uuid) -> AppResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.outbox_event_mut(id)?.mark_published(Utc::now()))
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> AppResult<bool> {
        let mut tables = self.tables()?;
        Ok(tables.outbox_event_mut(id)?.mark_failed(error, Utc::now()))
    }

    async fn resubmit_failed(&self, max_attempts: i32) -> AppResult<u64> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut moved = 0;
        for event in tables
            .outbox
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Failed && e.attempts < max_attempts)
        {
            event.status = OutboxStatus::New;
            event.updated_at = now;
            moved += 1;
        }
        Ok(moved)
    }

    async fn find_event(&self, id: Uuid) -> AppResult<Option<OutboxEvent>> {
        Ok(self.tables()?.outbox.iter().find(|e| e.id == id).cloned())
    }

    async fn stats(&self) -> AppResult<OutboxStats> {
        let tables = self.tables()?;
        let mut stats = OutboxStats::default();
        for event in &tables.outbox {
            match event.status {
                OutboxStatus::New => stats.new += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
