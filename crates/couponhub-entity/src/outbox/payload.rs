//! Typed outbox payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of the event written alongside a new reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponReservedPayload {
    /// Reservation to confirm.
    pub reservation_id: Uuid,
    /// Reserved coupon.
    pub coupon_id: Uuid,
    /// Reserving user.
    pub user_id: Uuid,
    /// Code the user presented.
    pub coupon_code: String,
    /// Idempotency key of the claim.
    pub idempotency_key: String,
}

impl CouponReservedPayload {
    /// Event type name used on the outbox row and the bus.
    pub const EVENT_TYPE: &'static str = "coupon.reserved";
}
