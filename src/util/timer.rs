//! Injectable wall-clock time.
//!
//! Everything time-dependent in the cache (freshness, purge polling, lock
//! stealing, timed statistics) reads the clock through [`Timer`] so tests
//! can drive it with [`MockTimer`].

use std::sync::atomic::{AtomicI64, Ordering};

pub const MS_US: i64 = 1_000;
pub const SECOND_MS: i64 = 1_000;
pub const SECOND_US: i64 = SECOND_MS * MS_US;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Source of the current time in epoch-relative units
pub trait Timer: Send + Sync {
    /// Microseconds since the Unix epoch
    fn now_us(&self) -> i64;

    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64 {
        self.now_us() / MS_US
    }
}

/// Timer backed by the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl SystemTimer {
    pub fn new() -> Self {
        SystemTimer
    }
}

impl Timer for SystemTimer {
    fn now_us(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

/// Manually advanced timer for tests
#[derive(Debug)]
pub struct MockTimer {
    now_us: AtomicI64,
}

impl MockTimer {
    /// Sun, 16 Dec 1979 02:27:45 GMT
    pub const START_MS: i64 = 314_159_265_000;

    pub fn new(start_ms: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_ms * MS_US),
        }
    }

    pub fn set_time_us(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    pub fn set_time_ms(&self, now_ms: i64) {
        self.set_time_us(now_ms * MS_US);
    }

    pub fn advance_us(&self, delta_us: i64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.advance_us(delta_ms * MS_US);
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new(Self::START_MS)
    }
}

impl Timer for MockTimer {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_timer_advances() {
        let timer = MockTimer::default();
        assert_eq!(timer.now_ms(), MockTimer::START_MS);

        timer.advance_ms(1500);
        assert_eq!(timer.now_ms(), MockTimer::START_MS + 1500);

        timer.advance_us(999);
        assert_eq!(timer.now_us(), (MockTimer::START_MS + 1500) * MS_US + 999);

        timer.set_time_ms(42);
        assert_eq!(timer.now_ms(), 42);
    }

    #[test]
    fn test_system_timer_is_after_2020() {
        let timer = SystemTimer::new();
        // 2020-01-01T00:00:00Z
        assert!(timer.now_ms() > 1_577_836_800_000);
    }
}
