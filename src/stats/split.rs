//! Split statistics
//!
//! Aggregates per-tenant statistics into a process-wide total. Every
//! primitive created here is a pair `(local, global)`: writes fan out to
//! both halves, reads come from the local half unless the name was marked
//! as a global read.
//!
//! # Architecture
//!
//! ```text
//!   SplitVariable("cache_hits").add(1)
//!            │
//!            ├──▶ local  Statistics ("vhost-a".cache_hits)
//!            └──▶ global Statistics (process.cache_hits)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::stats::histogram::Histogram;
use crate::stats::registry::{Statistics, StatsRegistry};
use crate::stats::timed_variable::{TimeLevel, TimedVariable};
use crate::stats::variables::{UpDownCounter, Variable};

/// Statistics writing through to a local and a global aggregate
pub struct SplitStatistics {
    local: Arc<dyn Statistics>,
    global: Arc<dyn Statistics>,
    global_reads: HashSet<String>,
    registry: StatsRegistry,
}

impl SplitStatistics {
    pub fn new(local: Arc<dyn Statistics>, global: Arc<dyn Statistics>) -> Self {
        Self {
            local,
            global,
            global_reads: HashSet::new(),
            registry: StatsRegistry::new(),
        }
    }

    /// Read the named statistics from the global half
    pub fn with_global_reads<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_reads.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn local(&self) -> &Arc<dyn Statistics> {
        &self.local
    }

    pub fn global(&self) -> &Arc<dyn Statistics> {
        &self.global
    }

    fn reads_global(&self, name: &str) -> bool {
        self.global_reads.contains(name)
    }
}

impl Statistics for SplitStatistics {
    fn registry(&self) -> &StatsRegistry {
        &self.registry
    }

    fn new_variable(&self, name: &str) -> Arc<dyn Variable> {
        Arc::new(SplitVariable {
            name: name.to_string(),
            local: self.local.get_variable(name),
            global: self.global.get_variable(name),
            read_global: self.reads_global(name),
        })
    }

    fn new_up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter> {
        Arc::new(SplitUpDownCounter {
            name: name.to_string(),
            local: self.local.get_up_down_counter(name),
            global: self.global.get_up_down_counter(name),
            read_global: self.reads_global(name),
        })
    }

    fn new_histogram(&self, name: &str) -> Arc<dyn Histogram> {
        Arc::new(SplitHistogram {
            name: name.to_string(),
            local: self.local.get_histogram(name),
            global: self.global.get_histogram(name),
            read_global: self.reads_global(name),
        })
    }

    fn new_timed_variable(&self, name: &str) -> Arc<dyn TimedVariable> {
        Arc::new(SplitTimedVariable {
            name: name.to_string(),
            local: self.local.get_timed_variable(name),
            global: self.global.get_timed_variable(name),
            read_global: self.reads_global(name),
        })
    }
}

// =============================================================================
// Split Primitives
// =============================================================================

struct SplitVariable {
    name: String,
    local: Arc<dyn Variable>,
    global: Arc<dyn Variable>,
    read_global: bool,
}

impl Variable for SplitVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self) -> i64 {
        if self.read_global {
            self.global.get()
        } else {
            self.local.get()
        }
    }

    fn add(&self, delta: i64) -> i64 {
        let local = self.local.add(delta);
        let global = self.global.add(delta);
        if self.read_global {
            global
        } else {
            local
        }
    }

    fn clear(&self) {
        self.local.clear();
        self.global.clear();
    }
}

struct SplitUpDownCounter {
    name: String,
    local: Arc<dyn UpDownCounter>,
    global: Arc<dyn UpDownCounter>,
    read_global: bool,
}

impl UpDownCounter for SplitUpDownCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self) -> i64 {
        if self.read_global {
            self.global.get()
        } else {
            self.local.get()
        }
    }

    fn set(&self, value: i64) {
        self.local.set(value);
        self.global.set(value);
    }

    fn set_returning_previous(&self, value: i64) -> i64 {
        let local = self.local.set_returning_previous(value);
        let global = self.global.set_returning_previous(value);
        if self.read_global {
            global
        } else {
            local
        }
    }

    fn add(&self, delta: i64) -> i64 {
        let local = self.local.add(delta);
        let global = self.global.add(delta);
        if self.read_global {
            global
        } else {
            local
        }
    }
}

struct SplitHistogram {
    name: String,
    local: Arc<dyn Histogram>,
    global: Arc<dyn Histogram>,
    read_global: bool,
}

impl SplitHistogram {
    fn reader(&self) -> &Arc<dyn Histogram> {
        if self.read_global {
            &self.global
        } else {
            &self.local
        }
    }
}

impl Histogram for SplitHistogram {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, value: f64) {
        self.local.add(value);
        self.global.add(value);
    }

    fn clear(&self) {
        self.local.clear();
        self.global.clear();
    }

    fn count(&self) -> u64 {
        self.reader().count()
    }

    fn average(&self) -> f64 {
        self.reader().average()
    }

    fn std_deviation(&self) -> f64 {
        self.reader().std_deviation()
    }

    fn percentile(&self, percent: f64) -> f64 {
        self.reader().percentile(percent)
    }

    fn minimum(&self) -> f64 {
        self.reader().minimum()
    }

    fn maximum(&self) -> f64 {
        self.reader().maximum()
    }

    fn set_max_value(&self, max_value: f64) {
        self.local.set_max_value(max_value);
        self.global.set_max_value(max_value);
    }

    fn enable_negative_buckets(&self) {
        self.local.enable_negative_buckets();
        self.global.enable_negative_buckets();
    }

    fn num_buckets(&self) -> usize {
        self.reader().num_buckets()
    }

    fn bucket(&self, index: usize) -> Option<(f64, u64)> {
        self.reader().bucket(index)
    }
}

struct SplitTimedVariable {
    name: String,
    local: Arc<dyn TimedVariable>,
    global: Arc<dyn TimedVariable>,
    read_global: bool,
}

impl TimedVariable for SplitTimedVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn inc_by(&self, delta: i64) {
        self.local.inc_by(delta);
        self.global.inc_by(delta);
    }

    fn get(&self, level: TimeLevel) -> i64 {
        if self.read_global {
            self.global.get(level)
        } else {
            self.local.get(level)
        }
    }

    fn clear(&self) {
        self.local.clear();
        self.global.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::registry::SimpleStats;
    use crate::util::timer::MockTimer;

    fn split_pair() -> (Arc<dyn Statistics>, SplitStatistics, SplitStatistics) {
        let timer = Arc::new(MockTimer::default());
        let global: Arc<dyn Statistics> = Arc::new(SimpleStats::new(timer.clone()));
        let a = SplitStatistics::new(Arc::new(SimpleStats::new(timer.clone())), global.clone());
        let b = SplitStatistics::new(Arc::new(SimpleStats::new(timer)), global.clone());
        (global, a, b)
    }

    #[test]
    fn test_writes_fan_out_reads_local() {
        let (global, a, b) = split_pair();
        a.get_variable("cache_hits").add(2);
        b.get_variable("cache_hits").add(3);

        assert_eq!(a.get_variable("cache_hits").get(), 2);
        assert_eq!(b.get_variable("cache_hits").get(), 3);
        assert_eq!(global.get_variable("cache_hits").get(), 5);
        assert_eq!(a.local().get_variable("cache_hits").get(), 2);
    }

    #[test]
    fn test_global_reads() {
        let timer = Arc::new(MockTimer::default());
        let global: Arc<dyn Statistics> = Arc::new(SimpleStats::new(timer.clone()));
        let a = SplitStatistics::new(Arc::new(SimpleStats::new(timer.clone())), global.clone())
            .with_global_reads(["purge_index"]);
        let b = SplitStatistics::new(Arc::new(SimpleStats::new(timer)), global.clone());

        b.get_variable("purge_index").add(4);
        a.get_variable("purge_index").add(1);
        assert_eq!(a.get_variable("purge_index").get(), 5);
        assert_eq!(b.get_variable("purge_index").get(), 4);
    }

    #[test]
    fn test_split_histogram_and_counter() {
        let (global, a, _b) = split_pair();
        let h = a.get_histogram("latency_us");
        h.add(10.0);
        h.add(30.0);
        assert_eq!(h.count(), 2);
        assert_eq!(global.get_histogram("latency_us").average(), 20.0);

        let c = a.get_up_down_counter("in_flight");
        c.add(3);
        assert_eq!(c.set_returning_previous(1), 3);
        assert_eq!(global.get_up_down_counter("in_flight").get(), 1);
    }
}
