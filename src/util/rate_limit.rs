//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max control messages per second on one connection
pub const CONTROL_RATE_LIMIT: u32 = 30;

/// Max binary snapshot frames per second on one connection
pub const SNAPSHOT_RATE_LIMIT: u32 = 60;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    control_limiter: Arc<Limiter>,
    snapshot_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self {
            control_limiter: create_limiter(CONTROL_RATE_LIMIT),
            snapshot_limiter: create_limiter(SNAPSHOT_RATE_LIMIT),
        }
    }

    /// Check if a control message is allowed (returns true if allowed)
    pub fn check_control(&self) -> bool {
        self.control_limiter.check().is_ok()
    }

    /// Check if a binary snapshot frame is allowed
    pub fn check_snapshot(&self) -> bool {
        self.snapshot_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
