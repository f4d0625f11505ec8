//! Key builders for every key the coupon subsystem writes.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the application uses.

use uuid::Uuid;

// ── Quota keys ─────────────────────────────────────────────

/// Remaining-count counter of a coupon.
pub fn remaining_count(coupon_id: Uuid) -> String {
    format!("coupon:remaining_count:{coupon_id}")
}

// ── Lock keys ──────────────────────────────────────────────

/// Lock key guarding the countdown of a coupon.
pub fn coupon_lock(coupon_id: Uuid) -> String {
    format!("coupon:lock:{coupon_id}")
}

/// Key holding the current owner of a lock.
pub fn lock_owner(key: &str) -> String {
    format!("lock:{key}")
}

/// Channel on which a lock's release is announced.
pub fn lock_channel(key: &str) -> String {
    format!("lock:{key}:released")
}

/// FIFO ticket queue of a lock.
pub fn lock_queue(key: &str) -> String {
    format!("lock:{key}:queue")
}

/// Liveness marker of one queued ticket.
pub fn lock_ticket(key: &str, ticket: &str) -> String {
    format!("lock:{key}:ticket:{ticket}")
}

/// Monotonic fencing counter of a lock.
pub fn fencing_counter(key: &str) -> String {
    format!("lock:{key}:fence")
}
