//! Wall-clock abstraction used for staleness checks, lease expiry and offer deadlines.
//!
//! All timestamps in the crate are unix milliseconds (`u64`). [`SystemClock`] is
//! anchored on `tokio::time::Instant`, so tests that pause tokio time see the same
//! virtual time in timestamps and in timers. [`ManualClock`] is fully caller driven.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ONE_SEC_MS: u64 = 1000;
pub const ONE_MIN_MS: u64 = 60 * ONE_SEC_MS;
pub const ONE_HOUR_MS: u64 = 60 * ONE_MIN_MS;

pub trait Clock: Send + Sync + Debug {
    /// Current time in unix milliseconds.
    fn now_ms(&self) -> u64;
}

/// Real time, advancing with the tokio clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
    origin_unix_ms: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::anchored_at(origin_unix_ms)
    }

    /// Clock whose current instant reads as `origin_unix_ms`.
    pub fn anchored_at(origin_unix_ms: u64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_unix_ms,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.origin);
        self.origin_unix_ms + elapsed.as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
