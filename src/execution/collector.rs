//! Per-Task Performance Collection
//!
//! Measures queue wait and execution time for one task and merges them with
//! the tracker's execution record. Each collector owns its own state, so any
//! number can run concurrently.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::tracker::ExecutionRecord;

/// Timing and throughput facts for one task.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// Time between task creation and worker pickup
    pub queue_time_secs: f64,
    /// Time between worker pickup and the final record being sealed
    pub execution_time_secs: f64,
    /// Tasks per second for this task (`1 / execution_time`)
    pub throughput: f64,
    /// Successful attempts divided by attempts
    pub success_rate: f64,
    pub error_rate: f64,
    pub retry_count: u32,
}

impl PerformanceMetrics {
    pub fn queue_time(&self) -> Duration {
        Duration::from_secs_f64(self.queue_time_secs)
    }

    pub fn execution_time(&self) -> Duration {
        Duration::from_secs_f64(self.execution_time_secs)
    }
}

/// Collects timing for a single task.
#[derive(Debug, Clone)]
pub struct PerformanceCollector {
    label: String,
    created_at: Instant,
    picked_up_at: Option<Instant>,
    /// Teardown of interrupted attempts, not counted as execution
    excluded: Duration,
}

impl PerformanceCollector {
    /// `created_at` marks the start of the task's queue wait.
    pub fn new(label: impl Into<String>, created_at: Instant) -> Self {
        Self {
            label: label.into(),
            created_at,
            picked_up_at: None,
            excluded: Duration::ZERO,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Marks worker pickup. Calling it again keeps the first pickup time.
    pub fn start_collection(&mut self) {
        self.picked_up_at.get_or_insert_with(Instant::now);
    }

    pub fn is_collecting(&self) -> bool {
        self.picked_up_at.is_some()
    }

    /// Leaves the teardown of a timed-out or cancelled attempt out of the
    /// execution time, so it ends where the attempt was cut off.
    pub fn exclude_teardown(&mut self, record: &ExecutionRecord) {
        if record.interrupted() {
            self.excluded += record.teardown;
        }
    }

    /// Seals the metrics using the final record and the number of retries taken.
    pub fn stop_collection(&self, record: &ExecutionRecord, retry_count: u32) -> PerformanceMetrics {
        let sealed_at = Instant::now();
        let picked_up_at = self.picked_up_at.unwrap_or(sealed_at);

        let queue_time = picked_up_at.saturating_duration_since(self.created_at);
        let execution_time = sealed_at
            .saturating_duration_since(picked_up_at)
            .saturating_sub(self.excluded);
        let execution_secs = execution_time.as_secs_f64();

        let throughput = if execution_secs > 0.0 {
            1.0 / execution_secs
        } else {
            0.0
        };

        // Only the last attempt can have succeeded
        let attempts = retry_count as f64 + 1.0;
        let success_rate = if record.success { 1.0 / attempts } else { 0.0 };

        PerformanceMetrics {
            queue_time_secs: queue_time.as_secs_f64(),
            execution_time_secs: execution_secs,
            throughput,
            success_rate,
            error_rate: 1.0 - success_rate,
            retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(success: bool) -> ExecutionRecord {
        let mut record = ExecutionRecord::not_started(vec!["true".to_string()], "", false);
        record.success = success;
        record.exit_code = Some(if success { 0 } else { 1 });
        record
    }

    #[test]
    fn test_queue_and_execution_time() {
        let created = Instant::now();
        let mut collector = PerformanceCollector::new("task-1", created);
        thread::sleep(Duration::from_millis(30));

        collector.start_collection();
        assert!(collector.is_collecting());
        thread::sleep(Duration::from_millis(40));

        let metrics = collector.stop_collection(&record(true), 0);
        assert!(metrics.queue_time() >= Duration::from_millis(30));
        assert!(metrics.execution_time() >= Duration::from_millis(40));
        assert!(metrics.throughput > 0.0);
        assert!((metrics.throughput - 1.0 / metrics.execution_time_secs).abs() < 1e-9);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.error_rate, 0.0);
    }

    #[test]
    fn test_timeout_teardown_excluded() {
        let mut collector = PerformanceCollector::new("task-5", Instant::now());
        collector.start_collection();
        thread::sleep(Duration::from_millis(300));

        let mut timed_out = record(false);
        timed_out.timed_out = true;
        timed_out.duration = Duration::from_millis(100);
        timed_out.teardown = Duration::from_millis(200);
        collector.exclude_teardown(&timed_out);

        // Normal exits keep their (small) drain time
        let mut exited = record(false);
        exited.teardown = Duration::from_millis(50);
        collector.exclude_teardown(&exited);

        let metrics = collector.stop_collection(&timed_out, 0);
        assert!(metrics.execution_time() >= Duration::from_millis(100));
        assert!(metrics.execution_time() < Duration::from_millis(200));
    }

    #[test]
    fn test_never_started_has_zero_throughput() {
        let collector = PerformanceCollector::new("task-2", Instant::now());
        let metrics = collector.stop_collection(&record(false), 0);

        assert_eq!(metrics.execution_time_secs, 0.0);
        assert_eq!(metrics.throughput, 0.0);
        assert_eq!(metrics.error_rate, 1.0);
    }

    #[test]
    fn test_retries_lower_success_rate() {
        let mut collector = PerformanceCollector::new("task-3", Instant::now());
        collector.start_collection();

        let metrics = collector.stop_collection(&record(true), 3);
        assert_eq!(metrics.retry_count, 3);
        assert_eq!(metrics.success_rate, 0.25);
        assert_eq!(metrics.error_rate, 0.75);
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut collector = PerformanceCollector::new("task-4", Instant::now());
        collector.start_collection();
        let first = collector.picked_up_at;
        thread::sleep(Duration::from_millis(5));
        collector.start_collection();
        assert_eq!(collector.picked_up_at, first);
    }

    #[test]
    fn test_concurrent_collectors_are_independent() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let mut collector = PerformanceCollector::new(format!("task-{}", i), Instant::now());
                    collector.start_collection();
                    thread::sleep(Duration::from_millis(10 * (i + 1)));
                    collector.stop_collection(&record(true), 0)
                })
            })
            .collect();

        let metrics: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(metrics[3].execution_time_secs > metrics[0].execution_time_secs);
    }
}
