//! # Rate Governor
//!
//! One token bucket per class of upstream operation. Acquisition never blocks:
//! an empty bucket returns `false` and the caller decides how long to back off.
//!
//! Buckets start full and refill continuously at `capacity / 60s`. Refill is
//! only computed once at least `refill_ms` has elapsed since the previous
//! refill, which bounds the bookkeeping cost without changing the long-run
//! rate. Each bucket has its own lock so the three classes never contend.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::configs::config_twin::{RateLimitOptions, MIN_REFILL_MS};

/// Class of upstream operation guarded by its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateBucket {
    /// Opening or extending a realtime session.
    SessionStart,
    /// Fetching a realtime snapshot.
    SessionPoll,
    /// Listing the fleet.
    FleetList,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket.
pub struct TokenBucket {
    capacity_per_min: f64,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity_per_min: u32, refill_ms: u64) -> Self {
        let capacity = capacity_per_min.max(1) as f64;
        Self {
            capacity_per_min: capacity,
            refill_every: Duration::from_millis(refill_ms.max(MIN_REFILL_MS)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills, then takes `tokens` if available. Atomic per bucket.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let wanted = tokens as f64;
        let mut state = self.state.lock();

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed >= self.refill_every {
            let earned = elapsed.as_secs_f64() * self.capacity_per_min / 60.0;
            state.tokens = (state.tokens + earned).min(self.capacity_per_min);
            state.last_refill = now;
        }

        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Current token count, without refilling.
    pub fn available(&self) -> f64 {
        self.state.lock().tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity_per_min
    }
}

/// The set of buckets protecting the upstream API.
pub struct RateGovernor {
    session_start: TokenBucket,
    session_poll: TokenBucket,
    fleet_list: TokenBucket,
}

impl RateGovernor {
    pub fn new(options: &RateLimitOptions) -> Self {
        Self {
            session_start: TokenBucket::new(options.session_start_per_min, options.refill_ms),
            session_poll: TokenBucket::new(options.session_poll_per_min, options.refill_ms),
            fleet_list: TokenBucket::new(options.fleet_list_per_min, options.refill_ms),
        }
    }

    pub fn bucket(&self, class: RateBucket) -> &TokenBucket {
        match class {
            RateBucket::SessionStart => &self.session_start,
            RateBucket::SessionPoll => &self.session_poll,
            RateBucket::FleetList => &self.fleet_list,
        }
    }

    /// Takes one token from the bucket of `class`.
    pub fn try_acquire(&self, class: RateBucket) -> bool {
        self.try_acquire_n(class, 1)
    }

    pub fn try_acquire_n(&self, class: RateBucket, tokens: u32) -> bool {
        let ok = self.bucket(class).try_acquire(tokens);
        if !ok {
            debug!(bucket = ?class, tokens, "rate limit bucket exhausted");
        }
        ok
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(&RateLimitOptions::default())
    }
}
