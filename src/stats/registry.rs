//! Statistics registry
//!
//! Named lookup and construction of statistic primitives.
//!
//! # Design
//!
//! - [`StatsRegistry`] keeps every registered primitive in insertion order
//!   so dumps are stable. A name registered twice with the same kind yields
//!   the existing primitive; with a different kind it is an error.
//! - [`Statistics`] is the seam components are handed at construction.
//!   Implementors supply the four factory methods; registration, lookup,
//!   listing and dumping are provided.
//! - `get_*` never fails. A kind conflict is logged and answered with a
//!   detached primitive that nothing else observes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::stats::histogram::{Histogram, MutexedHistogram};
use crate::stats::timed_variable::{MutexedTimedVariable, TimeLevel, TimedVariable};
use crate::stats::variables::{MutexedUpDownCounter, MutexedVariable, UpDownCounter, Variable};
use crate::util::timer::Timer;

/// Kind of a registered statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Variable,
    UpDownCounter,
    Histogram,
    TimedVariable,
}

impl StatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Variable => "variable",
            StatKind::UpDownCounter => "up-down counter",
            StatKind::Histogram => "histogram",
            StatKind::TimedVariable => "timed variable",
        }
    }
}

/// A registered statistic of any kind
#[derive(Clone)]
pub enum StatEntry {
    Variable(Arc<dyn Variable>),
    UpDownCounter(Arc<dyn UpDownCounter>),
    Histogram(Arc<dyn Histogram>),
    TimedVariable(Arc<dyn TimedVariable>),
}

impl StatEntry {
    pub fn kind(&self) -> StatKind {
        match self {
            StatEntry::Variable(_) => StatKind::Variable,
            StatEntry::UpDownCounter(_) => StatKind::UpDownCounter,
            StatEntry::Histogram(_) => StatKind::Histogram,
            StatEntry::TimedVariable(_) => StatKind::TimedVariable,
        }
    }

    fn clear(&self) {
        match self {
            StatEntry::Variable(v) => v.clear(),
            StatEntry::UpDownCounter(c) => c.clear(),
            StatEntry::Histogram(h) => h.clear(),
            StatEntry::TimedVariable(t) => t.clear(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    entries: HashMap<String, StatEntry>,
}

/// Insertion-ordered map from name to statistic
#[derive(Default)]
pub struct StatsRegistry {
    inner: RwLock<RegistryInner>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the statistic registered under `name`, creating it with
    /// `make` if absent
    pub fn register<F>(&self, name: &str, kind: StatKind, make: F) -> Result<StatEntry>
    where
        F: FnOnce() -> StatEntry,
    {
        if let Some(existing) = self.inner.read().entries.get(name) {
            return Self::check_kind(name, kind, existing);
        }
        let mut inner = self.inner.write();
        if let Some(existing) = inner.entries.get(name) {
            return Self::check_kind(name, kind, existing);
        }
        let entry = make();
        inner.order.push(name.to_string());
        inner.entries.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    fn check_kind(name: &str, kind: StatKind, existing: &StatEntry) -> Result<StatEntry> {
        if existing.kind() == kind {
            Ok(existing.clone())
        } else {
            Err(Error::StatisticKindConflict {
                name: name.to_string(),
                existing: existing.kind().as_str().to_string(),
            })
        }
    }

    pub fn find(&self, name: &str) -> Option<StatEntry> {
        self.inner.read().entries.get(name).cloned()
    }

    /// All entries in registration order
    pub fn entries(&self) -> Vec<(String, StatEntry)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name).map(|e| (name.clone(), e.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Statistics Trait
// =============================================================================

/// Registry of named statistics handed to every instrumented component
pub trait Statistics: Send + Sync {
    fn registry(&self) -> &StatsRegistry;

    fn new_variable(&self, name: &str) -> Arc<dyn Variable>;

    fn new_up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter>;

    fn new_histogram(&self, name: &str) -> Arc<dyn Histogram>;

    fn new_timed_variable(&self, name: &str) -> Arc<dyn TimedVariable>;

    fn add_variable(&self, name: &str) -> Result<Arc<dyn Variable>> {
        match self.registry().register(name, StatKind::Variable, || {
            StatEntry::Variable(self.new_variable(name))
        })? {
            StatEntry::Variable(v) => Ok(v),
            other => Err(kind_conflict(name, &other)),
        }
    }

    fn add_up_down_counter(&self, name: &str) -> Result<Arc<dyn UpDownCounter>> {
        match self.registry().register(name, StatKind::UpDownCounter, || {
            StatEntry::UpDownCounter(self.new_up_down_counter(name))
        })? {
            StatEntry::UpDownCounter(c) => Ok(c),
            other => Err(kind_conflict(name, &other)),
        }
    }

    fn add_histogram(&self, name: &str) -> Result<Arc<dyn Histogram>> {
        match self.registry().register(name, StatKind::Histogram, || {
            StatEntry::Histogram(self.new_histogram(name))
        })? {
            StatEntry::Histogram(h) => Ok(h),
            other => Err(kind_conflict(name, &other)),
        }
    }

    fn add_timed_variable(&self, name: &str) -> Result<Arc<dyn TimedVariable>> {
        match self.registry().register(name, StatKind::TimedVariable, || {
            StatEntry::TimedVariable(self.new_timed_variable(name))
        })? {
            StatEntry::TimedVariable(t) => Ok(t),
            other => Err(kind_conflict(name, &other)),
        }
    }

    fn find_variable(&self, name: &str) -> Option<Arc<dyn Variable>> {
        match self.registry().find(name)? {
            StatEntry::Variable(v) => Some(v),
            _ => None,
        }
    }

    fn find_up_down_counter(&self, name: &str) -> Option<Arc<dyn UpDownCounter>> {
        match self.registry().find(name)? {
            StatEntry::UpDownCounter(c) => Some(c),
            _ => None,
        }
    }

    fn find_histogram(&self, name: &str) -> Option<Arc<dyn Histogram>> {
        match self.registry().find(name)? {
            StatEntry::Histogram(h) => Some(h),
            _ => None,
        }
    }

    fn find_timed_variable(&self, name: &str) -> Option<Arc<dyn TimedVariable>> {
        match self.registry().find(name)? {
            StatEntry::TimedVariable(t) => Some(t),
            _ => None,
        }
    }

    /// Registered or newly registered variable; detached on kind conflict
    fn get_variable(&self, name: &str) -> Arc<dyn Variable> {
        self.add_variable(name).unwrap_or_else(|e| {
            warn!(error = %e, "Using detached variable");
            Arc::new(MutexedVariable::new(name))
        })
    }

    fn get_up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter> {
        self.add_up_down_counter(name).unwrap_or_else(|e| {
            warn!(error = %e, "Using detached up-down counter");
            Arc::new(MutexedUpDownCounter::new(name))
        })
    }

    fn get_histogram(&self, name: &str) -> Arc<dyn Histogram> {
        self.add_histogram(name).unwrap_or_else(|e| {
            warn!(error = %e, "Using detached histogram");
            Arc::new(MutexedHistogram::new(name))
        })
    }

    fn get_timed_variable(&self, name: &str) -> Arc<dyn TimedVariable> {
        self.add_timed_variable(name).unwrap_or_else(|e| {
            warn!(error = %e, "Using detached timed variable");
            self.new_timed_variable(name)
        })
    }

    /// Current value of every scalar (variables and up-down counters)
    fn scalar_values(&self) -> Vec<(String, i64)> {
        self.registry()
            .entries()
            .into_iter()
            .filter_map(|(name, entry)| match entry {
                StatEntry::Variable(v) => Some((name, v.get())),
                StatEntry::UpDownCounter(c) => Some((name, c.get())),
                _ => None,
            })
            .collect()
    }

    fn histograms(&self) -> Vec<(String, Arc<dyn Histogram>)> {
        self.registry()
            .entries()
            .into_iter()
            .filter_map(|(name, entry)| match entry {
                StatEntry::Histogram(h) => Some((name, h)),
                _ => None,
            })
            .collect()
    }

    /// Reset every registered statistic
    fn clear(&self) {
        for (_, entry) in self.registry().entries() {
            entry.clear();
        }
    }

    /// Human-readable dump, one statistic per line
    fn dump_text(&self) -> String {
        let mut out = String::new();
        for (name, entry) in self.registry().entries() {
            let _ = match entry {
                StatEntry::Variable(v) => writeln!(out, "{}: {}", name, v.get()),
                StatEntry::UpDownCounter(c) => writeln!(out, "{}: {}", name, c.get()),
                StatEntry::Histogram(h) => writeln!(
                    out,
                    "{}: count={} avg={:.1} p50={:.1} p99={:.1} min={:.1} max={:.1}",
                    name,
                    h.count(),
                    h.average(),
                    h.percentile(50.0),
                    h.percentile(99.0),
                    h.minimum(),
                    h.maximum()
                ),
                StatEntry::TimedVariable(t) => {
                    let windows: Vec<String> = TimeLevel::ALL
                        .iter()
                        .map(|level| format!("{}={}", level.as_str(), t.get(*level)))
                        .collect();
                    writeln!(out, "{}: {}", name, windows.join(" "))
                }
            };
        }
        out
    }
}

fn kind_conflict(name: &str, existing: &StatEntry) -> Error {
    Error::StatisticKindConflict {
        name: name.to_string(),
        existing: existing.kind().as_str().to_string(),
    }
}

// =============================================================================
// Simple Statistics
// =============================================================================

/// In-process statistics built from mutexed primitives
pub struct SimpleStats {
    registry: StatsRegistry,
    timer: Arc<dyn Timer>,
}

impl SimpleStats {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            registry: StatsRegistry::new(),
            timer,
        }
    }
}

impl Statistics for SimpleStats {
    fn registry(&self) -> &StatsRegistry {
        &self.registry
    }

    fn new_variable(&self, name: &str) -> Arc<dyn Variable> {
        Arc::new(MutexedVariable::new(name))
    }

    fn new_up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter> {
        Arc::new(MutexedUpDownCounter::new(name))
    }

    fn new_histogram(&self, name: &str) -> Arc<dyn Histogram> {
        Arc::new(MutexedHistogram::new(name))
    }

    fn new_timed_variable(&self, name: &str) -> Arc<dyn TimedVariable> {
        Arc::new(MutexedTimedVariable::new(name, self.timer.clone()))
    }
}
