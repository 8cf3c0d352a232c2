//! Bucketed histograms with summary statistics.
//!
//! Values fall into equal-width buckets spanning `[0, max_value)`, or
//! `[-max_value, max_value)` once negative buckets are enabled. Values
//! outside the range land in the first or last bucket; min, max, average
//! and standard deviation are tracked exactly regardless of bucketing.

use parking_lot::Mutex;

/// Default number of buckets
pub const DEFAULT_NUM_BUCKETS: usize = 500;

/// Default upper bound of the bucketed range
pub const DEFAULT_MAX_VALUE: f64 = 5000.0;

/// Histogram statistic
pub trait Histogram: Send + Sync {
    fn name(&self) -> &str;

    fn add(&self, value: f64);

    fn clear(&self);

    fn count(&self) -> u64;

    fn average(&self) -> f64;

    fn std_deviation(&self) -> f64;

    /// Approximate value below which `percent` of samples fall
    fn percentile(&self, percent: f64) -> f64;

    fn minimum(&self) -> f64;

    fn maximum(&self) -> f64;

    /// Change the bucketed range; clears existing samples
    fn set_max_value(&self, max_value: f64);

    /// Extend the range to negative values; clears existing samples
    fn enable_negative_buckets(&self);

    fn num_buckets(&self) -> usize;

    /// (lower bound, sample count) of bucket `index`
    fn bucket(&self, index: usize) -> Option<(f64, u64)>;
}

#[derive(Debug)]
struct HistogramState {
    buckets: Vec<u64>,
    max_value: f64,
    negative_buckets: bool,
    count: u64,
    sum: f64,
    sum_of_squares: f64,
    min: f64,
    max: f64,
}

impl HistogramState {
    fn new(num_buckets: usize) -> Self {
        Self {
            buckets: vec![0; num_buckets.max(1)],
            max_value: DEFAULT_MAX_VALUE,
            negative_buckets: false,
            count: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    fn lower_bound(&self) -> f64 {
        if self.negative_buckets {
            -self.max_value
        } else {
            0.0
        }
    }

    fn bucket_width(&self) -> f64 {
        (self.max_value - self.lower_bound()) / self.buckets.len() as f64
    }

    fn bucket_index(&self, value: f64) -> usize {
        let offset = (value - self.lower_bound()) / self.bucket_width();
        if offset.is_nan() || offset < 0.0 {
            0
        } else {
            (offset as usize).min(self.buckets.len() - 1)
        }
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
        self.count = 0;
        self.sum = 0.0;
        self.sum_of_squares = 0.0;
        self.min = 0.0;
        self.max = 0.0;
    }
}

/// Mutex-protected [`Histogram`]
#[derive(Debug)]
pub struct MutexedHistogram {
    name: String,
    state: Mutex<HistogramState>,
}

impl MutexedHistogram {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_buckets(name, DEFAULT_NUM_BUCKETS)
    }

    pub fn with_buckets(name: impl Into<String>, num_buckets: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(HistogramState::new(num_buckets)),
        }
    }
}

impl Histogram for MutexedHistogram {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, value: f64) {
        let mut state = self.state.lock();
        let index = state.bucket_index(value);
        state.buckets[index] += 1;
        if state.count == 0 {
            state.min = value;
            state.max = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
        state.count += 1;
        state.sum += value;
        state.sum_of_squares += value * value;
    }

    fn clear(&self) {
        self.state.lock().reset();
    }

    fn count(&self) -> u64 {
        self.state.lock().count
    }

    fn average(&self) -> f64 {
        let state = self.state.lock();
        if state.count == 0 {
            0.0
        } else {
            state.sum / state.count as f64
        }
    }

    fn std_deviation(&self) -> f64 {
        let state = self.state.lock();
        if state.count == 0 {
            return 0.0;
        }
        let n = state.count as f64;
        let mean = state.sum / n;
        (state.sum_of_squares / n - mean * mean).max(0.0).sqrt()
    }

    fn percentile(&self, percent: f64) -> f64 {
        let state = self.state.lock();
        if state.count == 0 {
            return 0.0;
        }
        let target = (percent.clamp(0.0, 100.0) / 100.0) * state.count as f64;
        let width = state.bucket_width();
        let mut cumulative = 0.0;
        for (index, &count) in state.buckets.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let count = count as f64;
            if cumulative + count >= target {
                let fraction = (target - cumulative) / count;
                let value = state.lower_bound() + (index as f64 + fraction) * width;
                return value.clamp(state.min, state.max);
            }
            cumulative += count;
        }
        state.max
    }

    fn minimum(&self) -> f64 {
        self.state.lock().min
    }

    fn maximum(&self) -> f64 {
        self.state.lock().max
    }

    fn set_max_value(&self, max_value: f64) {
        let mut state = self.state.lock();
        if max_value > 0.0 {
            state.max_value = max_value;
        }
        state.reset();
    }

    fn enable_negative_buckets(&self) {
        let mut state = self.state.lock();
        state.negative_buckets = true;
        state.reset();
    }

    fn num_buckets(&self) -> usize {
        self.state.lock().buckets.len()
    }

    fn bucket(&self, index: usize) -> Option<(f64, u64)> {
        let state = self.state.lock();
        let count = *state.buckets.get(index)?;
        Some((state.lower_bound() + index as f64 * state.bucket_width(), count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let h = MutexedHistogram::new("latency");
        assert_eq!(h.count(), 0);
        assert_eq!(h.average(), 0.0);
        assert_eq!(h.percentile(50.0), 0.0);
        assert_eq!(h.std_deviation(), 0.0);
    }

    #[test]
    fn test_summary_statistics() {
        let h = MutexedHistogram::new("latency");
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            h.add(v);
        }
        assert_eq!(h.count(), 8);
        assert_eq!(h.average(), 5.0);
        assert!((h.std_deviation() - 2.0).abs() < 1e-9);
        assert_eq!(h.minimum(), 2.0);
        assert_eq!(h.maximum(), 9.0);
    }

    #[test]
    fn test_percentiles() {
        let h = MutexedHistogram::with_buckets("latency", 100);
        h.set_max_value(100.0);
        for v in 1..=100 {
            h.add(v as f64);
        }
        assert!((h.percentile(50.0) - 50.0).abs() <= 1.5);
        assert!((h.percentile(90.0) - 90.0).abs() <= 1.5);
        assert_eq!(h.percentile(100.0), 100.0);
        assert_eq!(h.percentile(0.0), 1.0);
    }

    #[test]
    fn test_negative_buckets() {
        let h = MutexedHistogram::with_buckets("delta", 10);
        h.set_max_value(10.0);
        h.add(-5.0);
        // Without negative buckets everything below zero lands in bucket 0.
        assert_eq!(h.bucket(0), Some((0.0, 1)));

        h.enable_negative_buckets();
        assert_eq!(h.count(), 0);
        h.add(-5.0);
        h.add(5.0);
        assert_eq!(h.bucket(0), Some((-10.0, 0)));
        assert_eq!(h.bucket(2), Some((-6.0, 1)));
        assert_eq!(h.bucket(7), Some((4.0, 1)));
        assert_eq!(h.minimum(), -5.0);
        assert_eq!(h.average(), 0.0);
    }

    #[test]
    fn test_out_of_range_values_clamp_to_last_bucket() {
        let h = MutexedHistogram::with_buckets("big", 4);
        h.set_max_value(4.0);
        h.add(1_000.0);
        assert_eq!(h.bucket(3), Some((3.0, 1)));
        assert!(h.bucket(4).is_none());
        assert_eq!(h.maximum(), 1_000.0);
    }
}
