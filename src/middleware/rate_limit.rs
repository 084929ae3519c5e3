//! Per-principal token-bucket rate limiting.
//!
//! One bucket per principal, refilled lazily from elapsed time on each
//! check. Default capacity/refill come from process config; a tier can
//! override the capacity per call (e.g. trial's 10 rpm).

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: u32,
    refill: u32,
    window: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// `capacity` tokens, refilled at `refill` per `window`.
    pub fn new(capacity: u32, refill: u32, window: Duration) -> Self {
        Self {
            capacity,
            refill,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for the principal. Returns false when the bucket is
    /// empty (the caller synthesizes `error(code=rate_limited)`).
    /// `capacity_override` substitutes the bucket size for tier-specific
    /// limits; it only applies when the bucket is first created.
    pub fn check_and_consume(&self, principal_id: &str, capacity_override: Option<u32>) -> bool {
        self.consume_at(principal_id, capacity_override, Instant::now())
    }

    /// Clock-injected variant used directly by tests.
    fn consume_at(
        &self,
        principal_id: &str,
        capacity_override: Option<u32>,
        now: Instant,
    ) -> bool {
        let capacity = capacity_override.unwrap_or(self.capacity) as f64;
        let mut bucket = self
            .buckets
            .entry(principal_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if !elapsed.is_zero() {
            let refilled =
                elapsed.as_secs_f64() / self.window.as_secs_f64() * self.refill as f64;
            bucket.tokens = (bucket.tokens + refilled).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of principals with live buckets (for /metrics).
    pub fn tracked_principals(&self) -> usize {
        self.buckets.len()
    }
}
