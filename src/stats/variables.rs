//! Scalar statistics: up-counters and up-down counters.
//!
//! Every scalar takes its own mutex on each access. Contention is confined
//! to the variable being touched, never the registry.

use parking_lot::Mutex;
use tracing::debug;

/// Monotonic counter; only non-negative deltas are accepted
pub trait Variable: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self) -> i64;

    /// Add `delta` and return the new value. Negative deltas are ignored.
    fn add(&self, delta: i64) -> i64;

    fn clear(&self);
}

/// Signed counter that may be set directly
pub trait UpDownCounter: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self) -> i64;

    fn set(&self, value: i64);

    /// Store `value` and return what was there before, atomically
    fn set_returning_previous(&self, value: i64) -> i64;

    /// Add a signed delta and return the new value
    fn add(&self, delta: i64) -> i64;

    fn clear(&self) {
        self.set(0);
    }
}

/// Mutex-protected [`Variable`]
#[derive(Debug)]
pub struct MutexedVariable {
    name: String,
    value: Mutex<i64>,
}

impl MutexedVariable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(0),
        }
    }
}

impl Variable for MutexedVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self) -> i64 {
        *self.value.lock()
    }

    fn add(&self, delta: i64) -> i64 {
        let mut value = self.value.lock();
        if delta < 0 {
            debug!(variable = %self.name, delta, "Ignoring negative delta on up-counter");
            return *value;
        }
        *value = value.saturating_add(delta);
        *value
    }

    fn clear(&self) {
        *self.value.lock() = 0;
    }
}

/// Mutex-protected [`UpDownCounter`]
#[derive(Debug)]
pub struct MutexedUpDownCounter {
    name: String,
    value: Mutex<i64>,
}

impl MutexedUpDownCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(0),
        }
    }
}

impl UpDownCounter for MutexedUpDownCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self) -> i64 {
        *self.value.lock()
    }

    fn set(&self, value: i64) {
        *self.value.lock() = value;
    }

    fn set_returning_previous(&self, value: i64) -> i64 {
        std::mem::replace(&mut *self.value.lock(), value)
    }

    fn add(&self, delta: i64) -> i64 {
        let mut value = self.value.lock();
        *value = value.saturating_add(delta);
        *value
    }
}
