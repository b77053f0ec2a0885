use std::{fmt::Debug, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// A monotonic time source.
///
/// Every component that does time based accounting (token buckets, HTB classes, the pipeline
/// driver) reads time through a [`Clock`] so it can be swapped for a [`ManualClock`] in tests.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// The default clock, backed by [`tokio::time::Instant::now`].
///
/// Inside a runtime whose clock is paused (`#[tokio::test(start_paused = true)]`) this follows
/// the virtual tokio clock, outside of one it is equivalent to [`std::time::Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Cloning a [`ManualClock`] yields a handle to the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Creates a manual clock starting at the current instant.
    pub fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
