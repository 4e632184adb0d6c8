//! Benchmark Reports
//!
//! Per-task report entries and the aggregated session report. The
//! aggregated figures are always derivable from the per-task entries, so a
//! saved report can be re-checked after loading.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, Result};
use crate::execution::collector::PerformanceMetrics;
use crate::execution::task::{TaskId, TaskStatus};
use crate::monitoring::resource::ResourceRollup;
use crate::scheduler::TaskOutcome;

/// Everything recorded about one finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: TaskId,
    pub objective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub worker_id: Option<usize>,
    pub metrics: PerformanceMetrics,
    pub output_lines: u64,
    pub resources: ResourceRollup,
    /// Opaque externally computed score, only averaged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }
}

impl From<&TaskOutcome> for TaskReport {
    fn from(outcome: &TaskOutcome) -> Self {
        Self {
            task_id: outcome.task_id,
            objective: outcome.objective.clone(),
            strategy: outcome.strategy.clone(),
            status: outcome.status,
            exit_code: outcome.record.exit_code,
            failure: outcome.failure,
            reason: outcome.reason.clone(),
            worker_id: outcome.worker_id,
            metrics: outcome.metrics,
            output_lines: outcome.record.output_lines,
            resources: outcome.record.resources,
            quality_score: None,
        }
    }
}

/// Session-level rollup written as the detailed report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReport {
    /// When the report was sealed
    pub timestamp: DateTime<Utc>,
    /// Wall clock of the collection session in seconds
    pub duration: f64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
    pub peak_memory_mb: f64,
    pub average_cpu_percent: f64,
    /// Output lines per second of wall clock
    pub output_complexity_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_quality_score: Option<f64>,
    pub per_task: Vec<TaskReport>,
    /// Host monitor rollups by label
    #[serde(default)]
    pub resource_monitors: BTreeMap<String, ResourceRollup>,
}

impl AggregatedReport {
    /// Builds the rollup from per-task entries.
    ///
    /// Peak memory is the largest per-task process peak; average CPU is
    /// weighted by each task's CPU sample count.
    pub fn from_tasks(timestamp: DateTime<Utc>, duration: Duration, tasks: &[TaskReport]) -> Self {
        Self::from_parts(timestamp, duration.as_secs_f64(), tasks)
    }

    fn from_parts(timestamp: DateTime<Utc>, duration_secs: f64, tasks: &[TaskReport]) -> Self {
        let total_tasks = tasks.len() as u64;
        let completed_tasks = tasks.iter().filter(|t| t.is_success()).count() as u64;
        let failed_tasks = total_tasks - completed_tasks;

        let success_rate = if total_tasks == 0 {
            0.0
        } else {
            completed_tasks as f64 / total_tasks as f64
        };

        let peak_memory_mb = tasks
            .iter()
            .map(|t| t.resources.peak_memory_mb())
            .fold(0.0, f64::max);

        let (cpu_weighted, cpu_samples) = tasks.iter().fold((0.0, 0u64), |(sum, count), t| {
            (
                sum + t.resources.average_cpu_percent * t.resources.cpu_sample_count as f64,
                count + t.resources.cpu_sample_count,
            )
        });
        let average_cpu_percent = if cpu_samples == 0 {
            0.0
        } else {
            cpu_weighted / cpu_samples as f64
        };

        let total_lines: u64 = tasks.iter().map(|t| t.output_lines).sum();
        let output_complexity_score = if duration_secs > 0.0 {
            total_lines as f64 / duration_secs
        } else {
            0.0
        };

        let scores: Vec<f64> = tasks.iter().filter_map(|t| t.quality_score).collect();
        let average_quality_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        Self {
            timestamp,
            duration: duration_secs,
            total_tasks,
            completed_tasks,
            failed_tasks,
            success_rate,
            peak_memory_mb,
            average_cpu_percent,
            output_complexity_score,
            average_quality_score,
            per_task: tasks.to_vec(),
            resource_monitors: BTreeMap::new(),
        }
    }

    pub fn with_resource_monitors(mut self, monitors: BTreeMap<String, ResourceRollup>) -> Self {
        self.resource_monitors = monitors;
        self
    }

    /// Recomputes the rollup from this report's own per-task entries.
    pub fn rebuild(&self) -> Self {
        Self::from_parts(self.timestamp, self.duration, &self.per_task)
            .with_resource_monitors(self.resource_monitors.clone())
    }

    /// Tasks that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.per_task.iter().filter(|t| !t.is_success())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task_report(id: u64, status: TaskStatus, peak_mb: u64, cpu: f64, cpu_samples: u64, lines: u64) -> TaskReport {
        TaskReport {
            task_id: TaskId(id),
            objective: format!("objective {}", id),
            strategy: None,
            status,
            exit_code: Some(if status == TaskStatus::Success { 0 } else { 1 }),
            failure: (status != TaskStatus::Success).then_some(FailureKind::Exit),
            reason: None,
            worker_id: Some(0),
            metrics: PerformanceMetrics::default(),
            output_lines: lines,
            resources: ResourceRollup {
                sample_count: cpu_samples + 1,
                cpu_sample_count: cpu_samples,
                peak_memory_bytes: peak_mb * 1024 * 1024,
                average_cpu_percent: cpu,
                peak_cpu_percent: cpu,
                ..Default::default()
            },
            quality_score: None,
        }
    }

    fn sample_tasks() -> Vec<TaskReport> {
        vec![
            task_report(1, TaskStatus::Success, 10, 50.0, 3, 100),
            task_report(2, TaskStatus::Failure, 40, 10.0, 1, 20),
            task_report(3, TaskStatus::Success, 25, 0.0, 0, 80),
            task_report(4, TaskStatus::Timeout, 5, 90.0, 4, 0),
        ]
    }

    #[test]
    fn test_from_tasks_rollup() {
        let report = AggregatedReport::from_tasks(Utc::now(), Duration::from_secs(2), &sample_tasks());

        assert_eq!(report.total_tasks, 4);
        assert_eq!(report.completed_tasks, 2);
        assert_eq!(report.failed_tasks, 2);
        assert_eq!(report.success_rate, 0.5);
        assert_eq!(report.peak_memory_mb, 40.0);
        // (50*3 + 10*1 + 90*4) / 8
        assert!((report.average_cpu_percent - 65.0).abs() < 1e-9);
        assert_eq!(report.output_complexity_score, 100.0);
        assert_eq!(report.failures().count(), 2);
        assert!(report.average_quality_score.is_none());
    }

    #[test]
    fn test_empty_session() {
        let report = AggregatedReport::from_tasks(Utc::now(), Duration::ZERO, &[]);
        assert_eq!(report.total_tasks, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.output_complexity_score, 0.0);
        assert_eq!(report.average_cpu_percent, 0.0);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let mut monitors = BTreeMap::new();
        monitors.insert("host".to_string(), ResourceRollup::default());

        let report = AggregatedReport::from_tasks(Utc::now(), Duration::from_millis(1234), &sample_tasks())
            .with_resource_monitors(monitors);

        assert_eq!(report.rebuild(), report);
        assert_eq!(report.rebuild().rebuild(), report);
    }

    #[test]
    fn test_quality_scores_averaged() {
        let mut tasks = sample_tasks();
        tasks[0] = tasks[0].clone().with_quality_score(0.8);
        tasks[2] = tasks[2].clone().with_quality_score(0.4);

        let report = AggregatedReport::from_tasks(Utc::now(), Duration::from_secs(1), &tasks);
        let average = report.average_quality_score.unwrap();
        assert!((average - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_saved_report_reloads_and_rebuilds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");

        let report = AggregatedReport::from_tasks(Utc::now(), Duration::from_millis(750), &sample_tasks());
        report.save(&path).unwrap();

        let loaded = AggregatedReport::load(&path).unwrap();
        let rebuilt = loaded.rebuild();

        assert_eq!(loaded.total_tasks, report.total_tasks);
        assert_eq!(rebuilt.completed_tasks, report.completed_tasks);
        assert!((rebuilt.success_rate - report.success_rate).abs() < 1e-9);
        assert!((rebuilt.average_cpu_percent - report.average_cpu_percent).abs() < 1e-9);
        assert!((rebuilt.output_complexity_score - report.output_complexity_score).abs() < 1e-6);
    }

    #[test]
    fn test_json_field_names() {
        let report = AggregatedReport::from_tasks(Utc::now(), Duration::from_secs(1), &sample_tasks());
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        for key in [
            "timestamp",
            "duration",
            "totalTasks",
            "completedTasks",
            "failedTasks",
            "successRate",
            "peakMemoryMb",
            "averageCpuPercent",
            "outputComplexityScore",
            "perTask",
            "resourceMonitors",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["perTask"][0]["taskId"], 1);
        assert_eq!(value["perTask"][1]["status"], "failure");
    }
}
