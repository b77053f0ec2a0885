//! Token bucket rate limiting.
//!
//! A [`TokenBucket`] holds at most `capacity` bytes worth of tokens and refills at a fixed
//! [`Rate`]. Tokens are tracked in nano-bytes (bytes × 10⁹) which keeps refill arithmetic exact:
//! `rate (bytes/s) × elapsed (ns)` is a whole number of nano-bytes, so no fractional token is ever
//! lost between refills and the bucket does not drift over long runs.

use std::{fmt::Debug, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tshape_common::{constants::NANOS_PER_SEC, Clock, Rate, TokioClock};

const NANOS: u128 = NANOS_PER_SEC as u128;

/// A rate limiter that grants or denies byte budgets.
///
/// None of the methods block: callers that were denied can use [`RateLimiter::time_until`] to find
/// out how long to wait before retrying.
pub trait RateLimiter: Debug + Send + Sync {
    /// Refills, then takes `bytes` tokens if they are all present. Returns `false` and leaves the
    /// token count unchanged otherwise.
    fn consume(&self, bytes: u64) -> bool;

    /// Same as [`RateLimiter::consume`]. Neither variant ever waits.
    fn try_consume(&self, bytes: u64) -> bool {
        self.consume(bytes)
    }

    /// Whole tokens currently available, after a refill.
    fn available(&self) -> u64;

    /// Maximum number of tokens the bucket holds.
    fn capacity(&self) -> u64;

    /// Refill rate.
    fn rate(&self) -> Rate;

    /// Changes the fill rate. Tokens accrued at the old rate are credited first.
    fn set_rate(&self, rate: Rate);

    /// Changes the capacity. The current token count is clamped to the new capacity.
    fn set_capacity(&self, capacity: u64);

    /// How long until `bytes` tokens are available. `Some(Duration::ZERO)` if they already are,
    /// `None` if they never will be (more than the capacity, or a zero rate).
    fn time_until(&self, bytes: u64) -> Option<Duration>;

    /// Refills the bucket to capacity.
    fn reset(&self);
}

/// A point in time view of a [`TokenBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Bucket depth in bytes.
    pub capacity: u64,
    /// Refill rate.
    pub rate: Rate,
    /// Whole tokens available when the snapshot was taken.
    pub tokens: u64,
    /// Total bytes granted over the lifetime of the bucket.
    pub granted_bytes: u64,
    /// Number of denied consume requests.
    pub denied: u64,
}

#[derive(Debug)]
struct BucketState {
    capacity: u64,
    rate: Rate,
    nanotokens: u128,
    last_refill: Instant,
    granted_bytes: u64,
    denied: u64,
}

impl BucketState {
    #[inline]
    fn capacity_nanos(&self) -> u128 {
        self.capacity as u128 * NANOS
    }

    fn refill(&mut self, now: Instant) {
        // A clock that went backwards (e.g. a manual clock handle that was recreated) is treated
        // as no elapsed time.
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now.max(self.last_refill);

        let added = self.rate.bytes_per_sec() as u128 * elapsed.as_nanos();
        self.nanotokens = self.nanotokens.saturating_add(added).min(self.capacity_nanos());
    }

    #[inline]
    fn tokens(&self) -> u64 {
        (self.nanotokens / NANOS) as u64
    }
}

/// A thread safe token bucket.
///
/// Every operation runs inside a single critical section, so concurrent callers observe a
/// linearizable sequence of refills and consumes. The bucket starts full.
///
/// # Example
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use tshape_sched::{ManualClock, Rate, RateLimiter, TokenBucket};
///
/// let clock = ManualClock::new();
/// let bucket = TokenBucket::with_clock(1000, Rate::from_bytes_per_sec(1000), Arc::new(clock.clone()));
///
/// assert!(bucket.consume(500));
/// assert!(!bucket.consume(600));
/// assert_eq!(bucket.time_until(600), Some(Duration::from_millis(100)));
///
/// clock.advance(Duration::from_secs(1));
/// assert!(bucket.consume(500));
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Creates a full bucket that reads time from the tokio clock.
    pub fn new(capacity: u64, rate: Rate) -> Self {
        Self::with_clock(capacity, rate, Arc::new(TokioClock))
    }

    /// Creates a full bucket that reads time from `clock`.
    pub fn with_clock(capacity: u64, rate: Rate, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let state = BucketState {
            capacity,
            rate,
            nanotokens: capacity as u128 * NANOS,
            last_refill: now,
            granted_bytes: 0,
            denied: 0,
        };

        Self { state: Mutex::new(state), clock }
    }

    /// Returns the clock this bucket reads time from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Refills the bucket and returns its current state.
    pub fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.state.lock();
        state.refill(self.clock.now());

        BucketSnapshot {
            capacity: state.capacity,
            rate: state.rate,
            tokens: state.tokens(),
            granted_bytes: state.granted_bytes,
            denied: state.denied,
        }
    }
}

impl RateLimiter for TokenBucket {
    fn consume(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        state.refill(self.clock.now());

        let needed = bytes as u128 * NANOS;
        if state.nanotokens >= needed {
            state.nanotokens -= needed;
            state.granted_bytes = state.granted_bytes.saturating_add(bytes);
            true
        } else {
            state.denied += 1;
            false
        }
    }

    fn available(&self) -> u64 {
        let mut state = self.state.lock();
        state.refill(self.clock.now());
        state.tokens()
    }

    fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    fn rate(&self) -> Rate {
        self.state.lock().rate
    }

    fn set_rate(&self, rate: Rate) {
        let mut state = self.state.lock();
        state.refill(self.clock.now());
        state.rate = rate;
    }

    fn set_capacity(&self, capacity: u64) {
        let mut state = self.state.lock();
        state.refill(self.clock.now());
        state.capacity = capacity;
        state.nanotokens = state.nanotokens.min(state.capacity_nanos());
    }

    fn time_until(&self, bytes: u64) -> Option<Duration> {
        let mut state = self.state.lock();
        state.refill(self.clock.now());

        let needed = bytes as u128 * NANOS;
        if state.nanotokens >= needed {
            return Some(Duration::ZERO);
        }
        if bytes > state.capacity || state.rate.is_zero() {
            return None;
        }

        // Missing nano-bytes divided by bytes/s gives nanoseconds.
        let missing = needed - state.nanotokens;
        let nanos = missing.div_ceil(state.rate.bytes_per_sec() as u128);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.last_refill = self.clock.now();
        state.nanotokens = state.capacity_nanos();
    }
}
