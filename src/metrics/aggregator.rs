//! Metrics Aggregation
//!
//! Collects per-task reports and host resource monitors for one benchmark
//! session and seals them into an [`AggregatedReport`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};

use super::report::{AggregatedReport, TaskReport};
use crate::error::{BenchError, Result};
use crate::execution::collector::PerformanceCollector;
use crate::monitoring::resource::{SampleTarget, SamplerHandle, DEFAULT_SAMPLE_INTERVAL};
use crate::scheduler::TaskOutcome;

#[derive(Default)]
struct Session {
    started_at: Option<Instant>,
    tasks: Vec<TaskReport>,
    monitors: Vec<SamplerHandle>,
    last_report: Option<AggregatedReport>,
}

/// Session-scoped metrics collection.
///
/// Methods take `&self` so one aggregator can be shared between the
/// orchestrator and a performance monitor.
pub struct MetricsAggregator {
    session: Mutex<Session>,
    monitor_interval: Duration,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_monitor_interval(DEFAULT_SAMPLE_INTERVAL)
    }

    /// Uses `interval` for monitors created by [`Self::create_resource_monitor`].
    pub fn with_monitor_interval(interval: Duration) -> Self {
        Self {
            session: Mutex::new(Session::default()),
            monitor_interval: interval,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new session, discarding tasks from any previous one.
    pub fn start_collection(&self) {
        let mut session = self.session();
        if session.started_at.is_some() {
            warn!("Metrics collection restarted; {} recorded tasks discarded", session.tasks.len());
        }
        session.tasks.clear();
        session.monitors.clear();
        session.last_report = None;
        session.started_at = Some(Instant::now());
        debug!("Metrics collection started");
    }

    pub fn is_collecting(&self) -> bool {
        self.session().started_at.is_some()
    }

    /// Collector whose queue wait starts now.
    pub fn create_performance_collector(&self, label: impl Into<String>) -> PerformanceCollector {
        PerformanceCollector::new(label, Instant::now())
    }

    /// Starts a host sampler that lives until [`Self::stop_collection`].
    pub fn create_resource_monitor(&self, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        let mut session = self.session();

        if session.started_at.is_none() {
            return Err(BenchError::Configuration(
                "resource monitors need an active collection session".into(),
            ));
        }
        if session.monitors.iter().any(|m| m.label() == label) {
            return Err(BenchError::Configuration(format!(
                "resource monitor '{}' already exists",
                label
            )));
        }

        debug!("Resource monitor '{}' started", label);
        session
            .monitors
            .push(SamplerHandle::spawn(label, SampleTarget::Host, self.monitor_interval));
        Ok(())
    }

    pub fn record_task(&self, report: TaskReport) {
        let mut session = self.session();
        if session.started_at.is_none() {
            warn!("{} recorded outside a collection session", report.task_id);
        }
        session.tasks.push(report);
    }

    pub fn record_outcome(&self, outcome: &TaskOutcome) {
        self.record_task(TaskReport::from(outcome));
    }

    /// (total, completed, failed) recorded so far.
    pub fn task_counts(&self) -> (u64, u64, u64) {
        let session = self.session();
        let total = session.tasks.len() as u64;
        let completed = session.tasks.iter().filter(|t| t.is_success()).count() as u64;
        (total, completed, total - completed)
    }

    /// Interim report without ending the session.
    pub fn snapshot(&self) -> AggregatedReport {
        let session = self.session();
        let duration = session.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let monitors = session
            .monitors
            .iter()
            .map(|m| (m.label().to_string(), m.rollup()))
            .collect();

        AggregatedReport::from_tasks(Utc::now(), duration, &session.tasks).with_resource_monitors(monitors)
    }

    /// Ends the session: stops monitors and seals the report.
    pub fn stop_collection(&self) -> Result<AggregatedReport> {
        let mut session = self.session();
        let started_at = session.started_at.take().ok_or_else(|| {
            BenchError::Configuration("metrics collection was never started".into())
        })?;
        let duration = started_at.elapsed();

        let monitors: BTreeMap<_, _> = session
            .monitors
            .drain(..)
            .map(|m| (m.label().to_string(), m.stop()))
            .collect();

        let report = AggregatedReport::from_tasks(Utc::now(), duration, &session.tasks)
            .with_resource_monitors(monitors);

        info!(
            "Metrics collection stopped: {}/{} tasks succeeded in {:.2?}",
            report.completed_tasks, report.total_tasks, duration
        );
        session.last_report = Some(report.clone());
        Ok(report)
    }

    /// Report sealed by the last [`Self::stop_collection`].
    pub fn last_report(&self) -> Option<AggregatedReport> {
        self.session().last_report.clone()
    }

    /// Writes the sealed report, or an interim one while collecting.
    pub fn save_detailed_report(&self, path: impl AsRef<Path>) -> Result<()> {
        let report = match self.last_report() {
            Some(report) => report,
            None => self.snapshot(),
        };
        report.save(path.as_ref())?;
        info!("Detailed report written to {}", path.as_ref().display());
        Ok(())
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::execution::collector::PerformanceMetrics;
    use crate::execution::task::{TaskId, TaskStatus};
    use crate::monitoring::resource::ResourceRollup;
    use tempfile::tempdir;

    fn task(id: u64, success: bool) -> TaskReport {
        TaskReport {
            task_id: TaskId(id),
            objective: "probe".to_string(),
            strategy: Some("baseline".to_string()),
            status: if success { TaskStatus::Success } else { TaskStatus::Failure },
            exit_code: Some(if success { 0 } else { 2 }),
            failure: (!success).then_some(FailureKind::Exit),
            reason: (!success).then(|| "exit code 2".to_string()),
            worker_id: Some(0),
            metrics: PerformanceMetrics::default(),
            output_lines: 10,
            resources: ResourceRollup::default(),
            quality_score: None,
        }
    }

    #[test]
    fn test_stop_without_start_fails() {
        let aggregator = MetricsAggregator::new();
        assert!(aggregator.stop_collection().is_err());
    }

    #[test]
    fn test_session_rollup() {
        let aggregator = MetricsAggregator::new();
        aggregator.start_collection();
        assert!(aggregator.is_collecting());

        aggregator.record_task(task(1, true));
        aggregator.record_task(task(2, false));
        aggregator.record_task(task(3, true));
        assert_eq!(aggregator.task_counts(), (3, 2, 1));

        let report = aggregator.stop_collection().unwrap();
        assert!(!aggregator.is_collecting());
        assert_eq!(report.total_tasks, 3);
        assert_eq!(report.completed_tasks, 2);
        assert_eq!(report.failed_tasks, 1);
        assert_eq!(report.rebuild(), report);
        assert_eq!(aggregator.last_report(), Some(report));
    }

    #[test]
    fn test_restart_discards_previous_tasks() {
        let aggregator = MetricsAggregator::new();
        aggregator.start_collection();
        aggregator.record_task(task(1, true));
        aggregator.start_collection();

        assert_eq!(aggregator.task_counts(), (0, 0, 0));
    }

    #[test]
    fn test_resource_monitors_reported_by_label() {
        let aggregator = MetricsAggregator::with_monitor_interval(Duration::from_millis(20));
        assert!(aggregator.create_resource_monitor("host").is_err());

        aggregator.start_collection();
        aggregator.create_resource_monitor("host").unwrap();
        assert!(aggregator.create_resource_monitor("host").is_err());
        std::thread::sleep(Duration::from_millis(100));

        let report = aggregator.stop_collection().unwrap();
        let host = &report.resource_monitors["host"];
        assert!(host.sample_count >= 1);
    }

    #[test]
    fn test_performance_collector_is_independent() {
        let aggregator = MetricsAggregator::new();
        let mut first = aggregator.create_performance_collector("a");
        let second = aggregator.create_performance_collector("b");

        first.start_collection();
        assert!(first.is_collecting());
        assert!(!second.is_collecting());
        assert_eq!(second.label(), "b");
    }

    #[test]
    fn test_save_detailed_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");

        let aggregator = MetricsAggregator::new();
        aggregator.start_collection();
        aggregator.record_task(task(1, true));
        aggregator.stop_collection().unwrap();
        aggregator.save_detailed_report(&path).unwrap();

        let loaded = AggregatedReport::load(&path).unwrap();
        assert_eq!(loaded.total_tasks, 1);
        assert_eq!(loaded.per_task[0].strategy.as_deref(), Some("baseline"));
    }
}
