//! Time source shared by the limiter, breaker, task engine and ID generator.
//!
//! # Responsibilities
//! - Monotonic instants for refill, cool-down and retention arithmetic
//! - Wall-clock milliseconds for identifier timestamps
//!
//! # Design Decisions
//! - One trait object (`Arc<dyn Clock>`) threaded through every subsystem
//! - `ManualClock` lets tests move time forward deterministically

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of time for the pipeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic "now".
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Returns the process clock as a shared handle.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
///
/// Both the monotonic and wall readings advance together, except through
/// [`ManualClock::set_unix_millis`] which moves the wall clock alone (used to
/// simulate NTP steps).
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
    unix_millis: AtomicU64,
}

impl ManualClock {
    pub fn new(unix_millis: u64) -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
            unix_millis: AtomicU64::new(unix_millis),
        }
    }

    /// Move both readings forward.
    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
        self.unix_millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump the wall clock (forwards or backwards) without touching the
    /// monotonic reading.
    pub fn set_unix_millis(&self, millis: u64) {
        self.unix_millis.store(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(1_704_067_200_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    fn unix_millis(&self) -> u64 {
        self.unix_millis.load(Ordering::SeqCst)
    }
}
