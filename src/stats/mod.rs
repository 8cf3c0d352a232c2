//! Statistics
//!
//! Named numeric primitives, a registry to create and find them, a split
//! variant that writes through to a process-wide aggregate, and a logger
//! that periodically flushes snapshots to disk.
//!
//! # Primitives
//!
//! - [`Variable`] - up-counter, positive adds only
//! - [`UpDownCounter`] - signed, settable
//! - [`Histogram`] - bucketed, with percentiles and optional negative range
//! - [`TimedVariable`] - totals over the last 10s / minute / hour / since start

pub mod histogram;
pub mod logger;
pub mod registry;
pub mod split;
pub mod timed_variable;
pub mod variables;

pub use histogram::{Histogram, MutexedHistogram};
pub use logger::{HistogramSummary, StatisticsLogger, StatsSnapshot};
pub use registry::{SimpleStats, StatEntry, StatKind, Statistics, StatsRegistry};
pub use split::SplitStatistics;
pub use timed_variable::{MutexedTimedVariable, TimeLevel, TimedVariable};
pub use variables::{MutexedUpDownCounter, MutexedVariable, UpDownCounter, Variable};
