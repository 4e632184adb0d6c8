//! Performance Monitor
//!
//! Periodically polls its probes for a live snapshot, keeps a bounded
//! history, evaluates alert rules, and writes a summary report when stopped.
//!
//! The monitor only observes. Probes are injected at construction so tests
//! can drive it with synthetic streams.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::alert::{Alert, AlertMetric};
use super::resource::SamplerHandle;
use crate::config::{AlertThresholds, BenchConfig, MonitorSettings};
use crate::error::{BenchError, Result};
use crate::metrics::MetricsAggregator;
use crate::scheduler::WorkerPool;

/// Longest the loop sleeps before re-checking the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One live snapshot assembled from all probes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Workers currently executing a task
    pub active_workers: usize,
    pub total_workers: usize,
    pub queue_depth: usize,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl LiveMetrics {
    /// Empty snapshot stamped now.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            active_workers: 0,
            total_workers: 0,
            queue_depth: 0,
            memory_mb: 0.0,
            cpu_percent: 0.0,
        }
    }

    pub fn utilization(&self) -> f64 {
        if self.total_workers == 0 {
            0.0
        } else {
            self.active_workers as f64 / self.total_workers as f64
        }
    }

    fn finished(&self) -> u64 {
        self.completed_tasks + self.failed_tasks
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A source of live metrics.
///
/// Each probe fills the fields it knows; probes run in order, so a later
/// probe overwrites fields an earlier one set.
pub trait MetricsProbe: Send + Sync {
    fn probe(&self, metrics: &mut LiveMetrics);
}

impl MetricsProbe for WorkerPool {
    fn probe(&self, metrics: &mut LiveMetrics) {
        let pool = self.metrics();
        metrics.total_tasks = pool.total;
        metrics.completed_tasks = pool.completed;
        metrics.failed_tasks = pool.failed;
        metrics.active_workers = pool.active_workers;
        metrics.total_workers = pool.worker_count;
        metrics.queue_depth = pool.queue_length;

        if let Some(host) = self.host_usage() {
            metrics.memory_mb = host.memory_mb();
            metrics.cpu_percent = host.cpu_percent;
        }
    }
}

impl MetricsProbe for MetricsAggregator {
    fn probe(&self, metrics: &mut LiveMetrics) {
        let (total, completed, failed) = self.task_counts();
        metrics.total_tasks = total;
        metrics.completed_tasks = completed;
        metrics.failed_tasks = failed;
    }
}

impl MetricsProbe for SamplerHandle {
    fn probe(&self, metrics: &mut LiveMetrics) {
        if let Some(usage) = self.current() {
            metrics.memory_mb = usage.memory_mb();
            metrics.cpu_percent = usage.cpu_percent;
        }
    }
}

/// Monitor loop settings plus alert thresholds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitorConfig {
    pub settings: MonitorSettings,
    pub thresholds: AlertThresholds,
    /// Where the final report is written, if anywhere
    pub report_path: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.interval_ms)
    }
}

impl From<&BenchConfig> for MonitorConfig {
    fn from(config: &BenchConfig) -> Self {
        Self {
            settings: config.monitor.clone(),
            thresholds: config.alerts.clone(),
            report_path: None,
        }
    }
}

/// Mean and maximum of one metric over the history.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub max: f64,
}

impl MetricSummary {
    fn over(values: impl Iterator<Item = f64>) -> Self {
        let (sum, max, count) = values.fold((0.0, 0.0f64, 0u64), |(sum, max, count), v| {
            (sum + v, max.max(v), count + 1)
        });
        Self {
            mean: if count == 0 { 0.0 } else { sum / count as f64 },
            max,
        }
    }
}

/// Per-metric summary over the retained history.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSummary {
    pub active_workers: MetricSummary,
    pub utilization: MetricSummary,
    pub queue_depth: MetricSummary,
    pub memory_mb: MetricSummary,
    pub cpu_percent: MetricSummary,
    pub alerts_raised: u64,
}

/// Final monitor report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sample_count: u64,
    pub summary: MonitorSummary,
    pub recent_snapshots: Vec<LiveMetrics>,
}

/// Passive observer of a benchmark run.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    probes: Vec<Arc<dyn MetricsProbe>>,
    running: AtomicBool,
    history: Mutex<VecDeque<LiveMetrics>>,
    samples_taken: AtomicU64,
    alerts_raised: AtomicU64,
    alert_tx: Option<Mutex<Sender<Alert>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig, probes: Vec<Arc<dyn MetricsProbe>>) -> Self {
        let capacity = config.settings.history_capacity.max(1);
        Self {
            config,
            probes,
            running: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            samples_taken: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            alert_tx: None,
            started_at: Mutex::new(None),
        }
    }

    /// Forwards every alert to `tx` as well as the log.
    pub fn with_alert_sink(mut self, tx: Sender<Alert>) -> Self {
        self.alert_tx = Some(Mutex::new(tx));
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.report_path = Some(path.into());
        self
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<LiveMetrics>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Polls every probe into a fresh snapshot.
    pub fn collect(&self) -> LiveMetrics {
        let mut metrics = LiveMetrics::new();
        for probe in &self.probes {
            probe.probe(&mut metrics);
        }
        metrics
    }

    /// Failure share of tasks finished within the recent window.
    ///
    /// `None` when nothing finished inside the window.
    fn windowed_failure_rate(&self, metrics: &LiveMetrics) -> Option<f64> {
        let history = self.history();
        let window = self.config.settings.failure_window.max(1);
        let baseline = if history.len() >= window {
            history.get(history.len() - window).copied()
        } else {
            history.front().copied()
        };

        let (base_failed, base_finished) = baseline
            .map(|b| (b.failed_tasks, b.finished()))
            .unwrap_or((0, 0));
        let finished = metrics.finished().saturating_sub(base_finished);
        if finished == 0 {
            return None;
        }
        let failed = metrics.failed_tasks.saturating_sub(base_failed);
        Some(failed as f64 / finished as f64)
    }

    /// Checks a snapshot against the alert rules.
    pub fn evaluate(&self, metrics: &LiveMetrics) -> Vec<Alert> {
        let thresholds = &self.config.thresholds;
        let mut alerts = Vec::new();

        if let Some(rate) = self.windowed_failure_rate(metrics) {
            if rate > thresholds.failure_rate {
                alerts.push(Alert::new(AlertMetric::FailureRate, rate, thresholds.failure_rate));
            }
        }

        if metrics.total_workers > 0 && metrics.utilization() > thresholds.pool_utilization {
            alerts.push(Alert::new(
                AlertMetric::PoolUtilization,
                metrics.utilization(),
                thresholds.pool_utilization,
            ));
        }

        if metrics.queue_depth > thresholds.queue_depth {
            alerts.push(Alert::new(
                AlertMetric::QueueDepth,
                metrics.queue_depth as f64,
                thresholds.queue_depth as f64,
            ));
        }

        if metrics.memory_mb > thresholds.memory_mb as f64 {
            alerts.push(Alert::new(
                AlertMetric::MemoryUsage,
                metrics.memory_mb,
                thresholds.memory_mb as f64,
            ));
        }

        alerts
    }

    /// Evaluates a snapshot, stores it, and dispatches its alerts.
    pub fn record(&self, metrics: LiveMetrics) -> Vec<Alert> {
        let alerts = self.evaluate(&metrics);
        info!(
            "Snapshot: {}/{} finished, {}/{} workers busy, {} queued",
            metrics.finished(),
            metrics.total_tasks,
            metrics.active_workers,
            metrics.total_workers,
            metrics.queue_depth
        );

        {
            let mut history = self.history();
            if history.len() == self.config.settings.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(metrics);
        }
        self.samples_taken.fetch_add(1, Ordering::SeqCst);

        for alert in &alerts {
            warn!("Alert: {}", alert.message);
            self.alerts_raised.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = &self.alert_tx {
                let tx = tx.lock().unwrap_or_else(PoisonError::into_inner);
                if tx.send(alert.clone()).is_err() {
                    debug!("Alert receiver dropped");
                }
            }
        }

        alerts
    }

    /// Runs the monitoring loop on the calling thread until
    /// [`Self::stop_monitoring`] is called, then returns the final report.
    pub fn start_monitoring(&self) -> Result<MonitorReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BenchError::Configuration("monitor is already running".into()));
        }

        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        info!("Performance monitor started ({:?} interval)", self.config.interval());

        while self.is_running() {
            self.record(self.collect());
            self.pause();
        }

        // Final snapshot captures the end state
        self.record(self.collect());

        let report = self.report();
        if let Some(path) = &self.config.report_path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
            info!("Monitor report written to {}", path.display());
        }

        info!(
            "Performance monitor stopped: {} samples, {} alerts",
            report.sample_count, report.summary.alerts_raised
        );
        Ok(report)
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.config.interval();
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }

    pub fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Latest snapshot copy.
    pub fn current_metrics(&self) -> Option<LiveMetrics> {
        self.history().back().copied()
    }

    /// Copy of the retained history, oldest first.
    pub fn snapshots(&self) -> Vec<LiveMetrics> {
        self.history().iter().copied().collect()
    }

    pub fn summary(&self) -> MonitorSummary {
        let history = self.history();
        MonitorSummary {
            active_workers: MetricSummary::over(history.iter().map(|m| m.active_workers as f64)),
            utilization: MetricSummary::over(history.iter().map(|m| m.utilization())),
            queue_depth: MetricSummary::over(history.iter().map(|m| m.queue_depth as f64)),
            memory_mb: MetricSummary::over(history.iter().map(|m| m.memory_mb)),
            cpu_percent: MetricSummary::over(history.iter().map(|m| m.cpu_percent)),
            alerts_raised: self.alerts_raised.load(Ordering::SeqCst),
        }
    }

    /// Report over everything recorded so far.
    pub fn report(&self) -> MonitorReport {
        let end_time = Utc::now();
        let start_time = self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(end_time);

        let keep = self.config.settings.report_snapshots;
        let snapshots = self.snapshots();
        let recent_snapshots = snapshots[snapshots.len().saturating_sub(keep)..].to_vec();

        MonitorReport {
            start_time,
            end_time,
            sample_count: self.samples_taken.load(Ordering::SeqCst),
            summary: self.summary(),
            recent_snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use tempfile::tempdir;

    /// Probe replaying a scripted counter stream.
    struct ScriptedProbe {
        state: Mutex<LiveMetrics>,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                state: Mutex::new(LiveMetrics::new()),
            }
        }

        fn advance(&self, completed: u64, failed: u64) {
            let mut state = self.state.lock().unwrap();
            state.completed_tasks += completed;
            state.failed_tasks += failed;
            state.total_tasks += completed + failed;
        }

        fn set(&self, f: impl FnOnce(&mut LiveMetrics)) {
            f(&mut self.state.lock().unwrap());
        }
    }

    impl MetricsProbe for ScriptedProbe {
        fn probe(&self, metrics: &mut LiveMetrics) {
            let state = self.state.lock().unwrap();
            metrics.total_tasks = state.total_tasks;
            metrics.completed_tasks = state.completed_tasks;
            metrics.failed_tasks = state.failed_tasks;
            metrics.active_workers = state.active_workers;
            metrics.total_workers = state.total_workers;
            metrics.queue_depth = state.queue_depth;
            metrics.memory_mb = state.memory_mb;
        }
    }

    fn monitor_with(probe: &Arc<ScriptedProbe>) -> PerformanceMonitor {
        let mut config = MonitorConfig::default();
        config.settings.interval_ms = 10;
        config.settings.history_capacity = 8;
        config.settings.failure_window = 4;
        config.settings.report_snapshots = 3;
        PerformanceMonitor::new(config, vec![Arc::clone(probe) as Arc<dyn MetricsProbe>])
    }

    fn failure_alerts(monitor: &PerformanceMonitor, probe: &ScriptedProbe, completed: u64, failed: u64) -> usize {
        (0..10)
            .map(|_| {
                probe.advance(completed, failed);
                monitor
                    .record(monitor.collect())
                    .into_iter()
                    .filter(|a| a.metric == AlertMetric::FailureRate)
                    .count()
            })
            .sum()
    }

    #[test]
    fn test_failure_rate_above_threshold_alerts() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor_with(&probe);
        // 2 of every 10 tasks fail
        assert!(failure_alerts(&monitor, &probe, 8, 2) > 0);
    }

    #[test]
    fn test_failure_rate_below_threshold_is_quiet() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor_with(&probe);
        // 1 of every 20 tasks fails
        assert_eq!(failure_alerts(&monitor, &probe, 19, 1), 0);
    }

    #[test]
    fn test_failure_rate_is_windowed() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor_with(&probe);

        // Early burst of failures
        probe.advance(0, 10);
        assert!(!monitor.record(monitor.collect()).is_empty());

        // Clean stream pushes the burst out of the window
        for _ in 0..6 {
            probe.advance(10, 0);
            monitor.record(monitor.collect());
        }
        probe.advance(10, 0);
        let alerts = monitor.record(monitor.collect());
        assert!(alerts.iter().all(|a| a.metric != AlertMetric::FailureRate));
    }

    #[test]
    fn test_resource_alerts() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor_with(&probe);
        probe.set(|m| {
            m.active_workers = 4;
            m.total_workers = 4;
            m.queue_depth = 500;
            m.memory_mb = 16_000.0;
        });

        let metrics: Vec<AlertMetric> = monitor
            .evaluate(&monitor.collect())
            .into_iter()
            .map(|a| a.metric)
            .collect();
        assert_eq!(
            metrics,
            vec![
                AlertMetric::PoolUtilization,
                AlertMetric::QueueDepth,
                AlertMetric::MemoryUsage
            ]
        );
    }

    #[test]
    fn test_alert_sink_receives_alerts() {
        let probe = Arc::new(ScriptedProbe::new());
        let (tx, rx) = channel();
        let monitor = monitor_with(&probe).with_alert_sink(tx);

        probe.set(|m| m.queue_depth = 1000);
        monitor.record(monitor.collect());

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.metric, AlertMetric::QueueDepth);
        assert_eq!(monitor.summary().alerts_raised, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor_with(&probe);

        for depth in 0..20 {
            probe.set(|m| m.queue_depth = depth);
            monitor.record(monitor.collect());
        }

        let snapshots = monitor.snapshots();
        assert_eq!(snapshots.len(), 8);
        assert_eq!(snapshots[0].queue_depth, 12);
        assert_eq!(monitor.current_metrics().unwrap().queue_depth, 19);

        let summary = monitor.summary();
        assert_eq!(summary.queue_depth.max, 19.0);
        assert_eq!(summary.queue_depth.mean, 15.5);

        let report = monitor.report();
        assert_eq!(report.sample_count, 20);
        assert_eq!(report.recent_snapshots.len(), 3);
    }

    #[test]
    fn test_start_and_stop_writes_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.json");

        let probe = Arc::new(ScriptedProbe::new());
        let monitor = Arc::new(monitor_with(&probe).with_report_path(&path));

        let runner = Arc::clone(&monitor);
        let handle = thread::spawn(move || runner.start_monitoring());

        thread::sleep(Duration::from_millis(100));
        assert!(monitor.is_running());
        assert!(monitor.start_monitoring().is_err());
        monitor.stop_monitoring();

        let report = handle.join().unwrap().unwrap();
        assert!(report.sample_count >= 2);
        assert!(report.end_time >= report.start_time);

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        for key in ["startTime", "endTime", "sampleCount", "summary", "recentSnapshots"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
