//! Statistics Logger
//!
//! Periodically appends a JSON snapshot of every scalar and histogram to a
//! log file. Statistics stay process-local; the log is how several
//! processes sharing a cache are observed together.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::stats::registry::Statistics;
use crate::util::file_system::FileSystem;
use crate::util::timer::Timer;

/// Summary of one histogram at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub average: f64,
    pub p50: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

/// One line of the statistics log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub variables: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Appends statistics snapshots to a file
pub struct StatisticsLogger {
    stats: Arc<dyn Statistics>,
    file_system: Arc<dyn FileSystem>,
    timer: Arc<dyn Timer>,
    path: PathBuf,
    interval: Duration,
}

impl StatisticsLogger {
    pub fn new(
        stats: Arc<dyn Statistics>,
        file_system: Arc<dyn FileSystem>,
        timer: Arc<dyn Timer>,
        path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            stats,
            file_system,
            timer,
            path: path.into(),
            interval,
        }
    }

    /// Capture current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let timestamp = Utc
            .timestamp_millis_opt(self.timer.now_ms())
            .single()
            .unwrap_or_else(Utc::now);
        let variables = self.stats.scalar_values().into_iter().collect();
        let histograms = self
            .stats
            .histograms()
            .into_iter()
            .map(|(name, h)| {
                let summary = HistogramSummary {
                    count: h.count(),
                    average: h.average(),
                    p50: h.percentile(50.0),
                    p99: h.percentile(99.0),
                    min: h.minimum(),
                    max: h.maximum(),
                };
                (name, summary)
            })
            .collect();
        StatsSnapshot {
            timestamp,
            variables,
            histograms,
        }
    }

    /// Append one snapshot line
    pub fn log_once(&self) -> Result<()> {
        let mut line = serde_json::to_vec(&self.snapshot())?;
        line.push(b'\n');
        self.file_system.append_file(&self.path, &line)?;
        debug!(path = %self.path.display(), "Appended statistics snapshot");
        Ok(())
    }

    /// Log every interval until `shutdown` fires
    #[instrument(skip(self, shutdown), fields(path = %self.path.display()))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting statistics logger every {:?}", self.interval);

        let mut tick = interval(self.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.log_once() {
                        warn!("Failed to log statistics: {}", e);
                    }
                }

                _ = shutdown.cancelled() => {
                    info!("Statistics logger shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::registry::SimpleStats;
    use crate::util::file_system::MemFileSystem;
    use crate::util::timer::MockTimer;
    use std::path::Path;

    fn logger() -> (Arc<SimpleStats>, Arc<MemFileSystem>, Arc<StatisticsLogger>) {
        let timer = Arc::new(MockTimer::default());
        let stats = Arc::new(SimpleStats::new(timer.clone()));
        let fs = Arc::new(MemFileSystem::new(timer.clone()));
        let logger = Arc::new(StatisticsLogger::new(
            stats.clone(),
            fs.clone(),
            timer,
            "/stats.log",
            Duration::from_millis(10),
        ));
        (stats, fs, logger)
    }

    #[test]
    fn test_log_once_appends_json_lines() {
        let (stats, fs, logger) = logger();
        stats.get_variable("cache_hits").add(3);
        stats.get_histogram("latency_us").add(8.0);

        logger.log_once().unwrap();
        logger.log_once().unwrap();

        let contents = fs.read_file(Path::new("/stats.log")).unwrap().unwrap();
        let text = String::from_utf8(contents).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let snapshot: StatsSnapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(snapshot.variables["cache_hits"], 3);
        assert_eq!(snapshot.histograms["latency_us"].count, 1);
        assert_eq!(snapshot.timestamp.timestamp_millis(), MockTimer::START_MS);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_stats, fs, logger) = logger();
        let token = CancellationToken::new();
        let handle = tokio::spawn(logger.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(fs.exists(Path::new("/stats.log")));
    }
}
