//! Per-client rate limiting with two windows.
//!
//! Clients are keyed by token prefix, forwarded-for header, or peer IP (in
//! that order). A burst quota per second and a sustained quota per minute
//! both must admit the request.

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;

use crate::constants::{RATE_LIMIT_PER_MINUTE, RATE_LIMIT_PER_SECOND};

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct RateLimiter {
    per_second: KeyedLimiter,
    per_minute: KeyedLimiter,
    rps: u32,
    rpm: u32,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_PER_SECOND, RATE_LIMIT_PER_MINUTE)
    }
}

impl RateLimiter {
    pub fn new(rps: u32, rpm: u32) -> Self {
        let per_second = GovernorLimiter::keyed(Quota::per_second(
            NonZeroU32::new(rps.max(1)).unwrap(),
        ));
        let per_minute = GovernorLimiter::keyed(Quota::per_minute(
            NonZeroU32::new(rpm.max(1)).unwrap(),
        ));
        Self {
            per_second,
            per_minute,
            rps,
            rpm,
        }
    }

    /// Check both windows. Returns the human-readable denial reason when
    /// either window is exhausted. Stale per-key state is pruned lazily.
    pub fn check(&self, client_id: &str) -> Result<(), String> {
        self.per_second.retain_recent();
        self.per_minute.retain_recent();

        let key = client_id.to_string();
        if self.per_second.check_key(&key).is_err() {
            return Err(format!("Rate limit exceeded: {} requests/second", self.rps));
        }
        if self.per_minute.check_key(&key).is_err() {
            return Err(format!("Rate limit exceeded: {} requests/minute", self.rpm));
        }
        Ok(())
    }
}
