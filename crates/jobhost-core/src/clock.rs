//! Time sources.
//!
//! All live scheduling math runs on the *elapsed* base (monotonic
//! milliseconds, unaffected by wall-clock changes). The wall clock is only
//! consulted when converting to and from the durable snapshot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Source of elapsed and wall-clock time, in milliseconds.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary fixed origin.
    fn elapsed_millis(&self) -> i64;

    /// Milliseconds since the Unix epoch according to the real-time clock.
    fn wall_millis(&self) -> i64;
}

/// Process clock: elapsed time counts from construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed_millis(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn wall_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests and offline tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed: AtomicI64,
    wall: AtomicI64,
}

impl ManualClock {
    pub fn new(elapsed_millis: i64, wall_millis: i64) -> Self {
        Self {
            elapsed: AtomicI64::new(elapsed_millis),
            wall: AtomicI64::new(wall_millis),
        }
    }

    /// Move both time bases forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.elapsed.fetch_add(millis, Ordering::SeqCst);
        self.wall.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump the wall clock only, as a clock-sync event would.
    pub fn set_wall(&self, wall_millis: i64) {
        self.wall.store(wall_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn elapsed_millis(&self) -> i64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    fn wall_millis(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }
}
