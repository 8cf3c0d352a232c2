//! Counters that remember when their increments happened.
//!
//! Increments are grouped into 5-second buckets kept for one hour, so a
//! reader can ask for the total over the last ten seconds, minute, hour,
//! or since start.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::timer::{Timer, HOUR_MS, MINUTE_MS, SECOND_MS};

/// Width of one bucket
pub const BUCKET_MS: i64 = 5 * SECOND_MS;

/// Window a [`TimedVariable`] read covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeLevel {
    TenSec,
    Minute,
    Hour,
    Start,
}

impl TimeLevel {
    pub const ALL: [TimeLevel; 4] = [
        TimeLevel::TenSec,
        TimeLevel::Minute,
        TimeLevel::Hour,
        TimeLevel::Start,
    ];

    fn window_ms(self) -> Option<i64> {
        match self {
            TimeLevel::TenSec => Some(10 * SECOND_MS),
            TimeLevel::Minute => Some(MINUTE_MS),
            TimeLevel::Hour => Some(HOUR_MS),
            TimeLevel::Start => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeLevel::TenSec => "10s",
            TimeLevel::Minute => "1m",
            TimeLevel::Hour => "1h",
            TimeLevel::Start => "start",
        }
    }
}

/// Counter readable over several trailing windows
pub trait TimedVariable: Send + Sync {
    fn name(&self) -> &str;

    fn inc_by(&self, delta: i64);

    fn get(&self, level: TimeLevel) -> i64;

    fn clear(&self);
}

#[derive(Debug, Default)]
struct TimedState {
    // (bucket start ms, sum), oldest first
    buckets: VecDeque<(i64, i64)>,
    total: i64,
}

impl TimedState {
    fn expire(&mut self, now_ms: i64) {
        while let Some(&(start, _)) = self.buckets.front() {
            if start + HOUR_MS <= now_ms {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Mutex-protected [`TimedVariable`] driven by an injected timer
pub struct MutexedTimedVariable {
    name: String,
    timer: Arc<dyn Timer>,
    state: Mutex<TimedState>,
}

impl MutexedTimedVariable {
    pub fn new(name: impl Into<String>, timer: Arc<dyn Timer>) -> Self {
        Self {
            name: name.into(),
            timer,
            state: Mutex::new(TimedState::default()),
        }
    }
}

impl TimedVariable for MutexedTimedVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn inc_by(&self, delta: i64) {
        let now_ms = self.timer.now_ms();
        let bucket_start = now_ms - now_ms.rem_euclid(BUCKET_MS);
        let mut state = self.state.lock();
        state.expire(now_ms);
        state.total += delta;
        match state.buckets.back_mut() {
            Some((start, sum)) if *start == bucket_start => *sum += delta,
            _ => state.buckets.push_back((bucket_start, delta)),
        }
    }

    fn get(&self, level: TimeLevel) -> i64 {
        let now_ms = self.timer.now_ms();
        let mut state = self.state.lock();
        state.expire(now_ms);
        match level.window_ms() {
            None => state.total,
            Some(window) => state
                .buckets
                .iter()
                .filter(|(start, _)| start + window > now_ms)
                .map(|(_, sum)| sum)
                .sum(),
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::timer::MockTimer;

    #[test]
    fn test_windows() {
        let timer = Arc::new(MockTimer::new(0));
        let var = MutexedTimedVariable::new("rewrites", timer.clone());

        var.inc_by(1);
        timer.advance_ms(20 * SECOND_MS);
        var.inc_by(2);
        assert_eq!(var.get(TimeLevel::TenSec), 2);
        assert_eq!(var.get(TimeLevel::Minute), 3);

        timer.advance_ms(2 * MINUTE_MS);
        var.inc_by(4);
        assert_eq!(var.get(TimeLevel::TenSec), 4);
        assert_eq!(var.get(TimeLevel::Minute), 4);
        assert_eq!(var.get(TimeLevel::Hour), 7);
        assert_eq!(var.get(TimeLevel::Start), 7);

        timer.advance_ms(HOUR_MS);
        assert_eq!(var.get(TimeLevel::Hour), 0);
        assert_eq!(var.get(TimeLevel::Start), 7);
    }

    #[test]
    fn test_same_bucket_accumulates() {
        let timer = Arc::new(MockTimer::new(0));
        let var = MutexedTimedVariable::new("x", timer.clone());
        var.inc_by(1);
        timer.advance_ms(1_000);
        var.inc_by(1);
        assert_eq!(var.get(TimeLevel::TenSec), 2);
        var.clear();
        assert_eq!(var.get(TimeLevel::Start), 0);
    }
}
