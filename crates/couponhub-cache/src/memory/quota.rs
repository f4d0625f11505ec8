//! In-memory quota counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use couponhub_core::result::AppResult;
use couponhub_core::traits::quota::{QuotaCounter, QuotaDecision};

#[derive(Debug, Clone, Copy)]
struct Counter {
    remaining: i64,
    expires_at: Instant,
}

impl Counter {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Per-coupon remaining-count counter held in process memory.
///
/// The initialize/check/decrement sequence runs while holding the
/// dashmap entry lock of the coupon, so concurrent callers are serialized
/// per coupon exactly like the server-side script of the Redis variant.
#[derive(Debug, Clone)]
pub struct MemoryQuotaCounter {
    counters: Arc<DashMap<Uuid, Counter>>,
    ttl: Duration,
}

impl MemoryQuotaCounter {
    /// Create a counter store whose entries expire `ttl` after initialization.
    pub fn new(ttl: Duration) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl QuotaCounter for MemoryQuotaCounter {
    async fn check_and_decrement(
        &self,
        coupon_id: Uuid,
        total_count: i64,
    ) -> AppResult<QuotaDecision> {
        let mut entry = match self.counters.entry(coupon_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Counter {
                        remaining: total_count,
                        expires_at: Instant::now() + self.ttl,
                    });
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(Counter {
                remaining: total_count,
                expires_at: Instant::now() + self.ttl,
            }),
        };

        if entry.remaining <= 0 {
            return Ok(QuotaDecision {
                success: false,
                issued: total_count - entry.remaining,
                remaining: entry.remaining,
            });
        }

        entry.remaining -= 1;
        Ok(QuotaDecision {
            success: true,
            issued: total_count - entry.remaining,
            remaining: entry.remaining,
        })
    }

    async fn rollback(&self, coupon_id: Uuid) -> AppResult<Option<i64>> {
        match self.counters.get_mut(&coupon_id) {
            Some(mut counter) if !counter.is_expired() => {
                counter.remaining += 1;
                Ok(Some(counter.remaining))
            }
            _ => Ok(None),
        }
    }

    async fn remaining(&self, coupon_id: Uuid) -> AppResult<Option<i64>> {
        Ok(self
            .counters
            .get(&coupon_id)
            .filter(|c| !c.is_expired())
            .map(|c| c.remaining))
    }

    async fn reset(&self, coupon_id: Uuid, remaining: i64) -> AppResult<()> {
        self.counters.insert(
            coupon_id,
            Counter {
                remaining,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }
}
