//! Aggregation of request events into a run report.

use crate::load::task::{RequestEvent, TaskKind};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-task statistics.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub successes: u64,
    pub failures: u64,
    /// Response bytes over successful requests.
    pub response_bytes: u64,
    /// Response time of every request, successful or not.
    latencies: Vec<Duration>,
    sorted: bool,
}

impl TaskStats {
    fn record(&mut self, event: &RequestEvent) {
        match &event.result {
            Ok(bytes) => {
                self.successes += 1;
                self.response_bytes += *bytes as u64;
            }
            Err(_) => self.failures += 1,
        }
        self.latencies.push(event.response_time);
        self.sorted = false;
    }

    fn finish(&mut self) {
        if !self.sorted {
            self.latencies.sort_unstable();
            self.sorted = true;
        }
    }

    pub fn requests(&self) -> u64 {
        self.successes + self.failures
    }

    /// Nearest-rank percentile, `pct` in `0.0..=100.0`.
    pub fn percentile(&self, pct: f64) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted;
        let latencies = if self.sorted {
            &self.latencies
        } else {
            sorted = self.latencies.clone();
            sorted.sort_unstable();
            &sorted
        };
        let rank = ((pct / 100.0) * latencies.len() as f64).ceil() as usize;
        Some(latencies[rank.clamp(1, latencies.len()) - 1])
    }

    pub fn min(&self) -> Option<Duration> {
        self.latencies.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.latencies.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.latencies.len()).ok().filter(|&n| n > 0)?;
        Some(self.latencies.iter().sum::<Duration>() / count)
    }
}

/// Result of one load run.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub users: usize,
    pub tasks: BTreeMap<TaskKind, TaskStats>,
    /// Failure counts keyed by `LoadError::kind`.
    pub failure_kinds: BTreeMap<&'static str, u64>,
}

impl LoadReport {
    pub fn new(users: usize) -> Self {
        Self {
            started_at: Local::now(),
            elapsed: Duration::ZERO,
            users,
            tasks: BTreeMap::new(),
            failure_kinds: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, event: &RequestEvent) {
        if let Err(e) = &event.result {
            debug!(task = %event.kind, error = %e, "Request failed");
            *self.failure_kinds.entry(e.kind()).or_default() += 1;
        }
        self.tasks.entry(event.kind).or_default().record(event);
    }

    /// Drain `events` until every sender is gone.
    pub async fn collect(&mut self, mut events: mpsc::Receiver<RequestEvent>) {
        while let Some(event) = events.recv().await {
            self.record(&event);
        }
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        for stats in self.tasks.values_mut() {
            stats.finish();
        }
    }

    pub fn task(&self, kind: TaskKind) -> Option<&TaskStats> {
        self.tasks.get(&kind)
    }

    pub fn total_requests(&self) -> u64 {
        self.tasks.values().map(TaskStats::requests).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.tasks.values().map(|s| s.failures).sum()
    }

    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_requests() as f64 / secs
        } else {
            0.0
        }
    }
}

fn millis(d: Option<Duration>) -> String {
    d.map(|d| format!("{:.1}", d.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Load Test Results ---")?;
        writeln!(f, "Started:        {}", self.started_at.to_rfc3339())?;
        writeln!(f, "Users:          {}", self.users)?;
        writeln!(f, "Duration:       {:.2?}", self.elapsed)?;
        writeln!(f, "Requests:       {}", self.total_requests())?;
        writeln!(f, "Failures:       {}", self.total_failures())?;
        writeln!(f, "Requests/sec:   {:.2}", self.requests_per_sec())?;
        writeln!(f)?;
        writeln!(
            f,
            "{:<8} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10}",
            "task", "reqs", "fails", "min ms", "p50 ms", "p95 ms", "max ms", "avg ms", "bytes"
        )?;
        for (kind, stats) in &self.tasks {
            writeln!(
                f,
                "{:<8} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10}",
                kind.name(),
                stats.requests(),
                stats.failures,
                millis(stats.min()),
                millis(stats.percentile(50.0)),
                millis(stats.percentile(95.0)),
                millis(stats.max()),
                millis(stats.mean()),
                stats.response_bytes,
            )?;
        }
        if !self.failure_kinds.is_empty() {
            writeln!(f)?;
            writeln!(f, "Failures by kind:")?;
            for (kind, count) in &self.failure_kinds {
                writeln!(f, "  {kind:<10} {count}")?;
            }
        }
        write!(f, "-------------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;

    fn ok(kind: TaskKind, ms: u64, bytes: usize) -> RequestEvent {
        RequestEvent {
            kind,
            response_time: Duration::from_millis(ms),
            result: Ok(bytes),
        }
    }

    #[test]
    fn test_aggregation() {
        let mut report = LoadReport::new(2);
        for ms in 1..=10 {
            report.record(&ok(TaskKind::Short, ms, 20));
        }
        report.record(&RequestEvent {
            kind: TaskKind::Long,
            response_time: Duration::from_millis(3),
            result: Err(LoadError::UnexpectedEof),
        });
        report.finish(Duration::from_secs(2));

        let short = report.task(TaskKind::Short).unwrap();
        assert_eq!(short.successes, 10);
        assert_eq!(short.response_bytes, 200);
        assert_eq!(short.min(), Some(Duration::from_millis(1)));
        assert_eq!(short.max(), Some(Duration::from_millis(10)));
        assert_eq!(short.percentile(50.0), Some(Duration::from_millis(5)));
        assert_eq!(short.percentile(95.0), Some(Duration::from_millis(10)));
        assert_eq!(short.mean(), Some(Duration::from_micros(5500)));

        let long = report.task(TaskKind::Long).unwrap();
        assert_eq!(long.failures, 1);
        assert_eq!(report.failure_kinds.get("eof"), Some(&1));
        assert_eq!(report.total_requests(), 11);
        assert_eq!(report.total_failures(), 1);
        assert!((report.requests_per_sec() - 5.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats() {
        let stats = TaskStats::default();
        assert_eq!(stats.percentile(50.0), None);
        assert_eq!(stats.mean(), None);
        assert_eq!(LoadReport::new(1).requests_per_sec(), 0.0);
    }

    #[test]
    fn test_display_lists_tasks() {
        let mut report = LoadReport::new(1);
        report.record(&ok(TaskKind::Long, 4, 300));
        report.finish(Duration::from_secs(1));

        let text = report.to_string();
        assert!(text.contains("--- Load Test Results ---"));
        assert!(text.contains("long"));
        assert!(!text.contains("Failures by kind"));
    }

    #[tokio::test]
    async fn test_collect_until_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for ms in [1, 2, 3] {
                tx.send(ok(TaskKind::Short, ms, 10)).await.unwrap();
            }
        });

        let mut report = LoadReport::new(1);
        report.collect(rx).await;
        producer.await.unwrap();
        assert_eq!(report.total_requests(), 3);
    }
}
