//! Reservation status enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a coupon reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Created with the claim; waiting for the consumer.
    Pending,
    /// Confirmed by the consumer.
    Confirmed,
    /// Issuance was rejected for good; the unit went back to the counter.
    Failed,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
