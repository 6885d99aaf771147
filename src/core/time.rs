//! Cached wall-clock utilities.
//!
//! The reactor freezes a wall-clock sample for the duration of the outermost
//! execution unit so that every key access within one logical operation
//! observes the same instant. Elapsed-time measurement always uses the
//! monotonic clock (`std::time::Instant`); the cached unix clock is only a
//! consistency device, never a stopwatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sample the wall clock in milliseconds since the unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sample the wall clock in microseconds since the unix epoch.
pub fn unix_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// A refresh-on-demand cache of the wall clock at millisecond and
/// microsecond resolution.
///
/// The cache is refreshed on the 0→1 execution-unit transition and from the
/// scheduler's post-sleep hook; everything on the reactor reads the cached
/// values instead of sampling the clock per access.
#[derive(Debug)]
pub struct ClockCache {
    ms: AtomicU64,
    us: AtomicU64,
}

impl ClockCache {
    pub fn new() -> Self {
        let cache = Self {
            ms: AtomicU64::new(0),
            us: AtomicU64::new(0),
        };
        cache.refresh();
        cache
    }

    /// Re-sample the wall clock into the cache.
    pub fn refresh(&self) {
        let us = unix_us();
        self.us.store(us, Ordering::Release);
        self.ms.store(us / 1000, Ordering::Release);
    }

    /// Cached milliseconds since the unix epoch.
    pub fn cached_ms(&self) -> u64 {
        self.ms.load(Ordering::Acquire)
    }

    /// Cached microseconds since the unix epoch.
    pub fn cached_us(&self) -> u64 {
        self.us.load(Ordering::Acquire)
    }
}

impl Default for ClockCache {
    fn default() -> Self {
        Self::new()
    }
}
