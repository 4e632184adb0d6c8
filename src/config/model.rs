//! Configuration Data Model
//!
//! Every field has a default so a config file only needs to name what it
//! changes.
//!
//! # Example YAML Format
//!
//! ```yaml
//! execution_mode: threaded
//! scheduling_algorithm: least_loaded
//! limits:
//!   max_concurrent_tasks: 4
//!   max_cpu_percent: 90.0
//!   task_timeout_secs: 120
//! workers:
//!   min: 2
//!   max: 8
//! auto_scaling: true
//! alerts:
//!   failure_rate: 0.1
//!   queue_depth: 50
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::monitoring::resource::{host_memory_mb, logical_cores};
use crate::scheduler::SchedulingAlgorithm;

/// How worker threads drive their invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each worker owns a single-threaded runtime
    #[default]
    Threaded,
    /// Workers share one multi-threaded runtime
    Hybrid,
}

impl std::str::FromStr for ExecutionMode {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" | "thread" => Ok(Self::Threaded),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(BenchError::Configuration(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Global resource ceilings applied at admission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Host CPU usage (0-100) above which new admissions wait
    pub max_cpu_percent: Option<f64>,
    /// Host memory usage above which new admissions wait
    pub max_memory_mb: Option<u64>,
    /// Maximum number of simultaneously admitted tasks
    pub max_concurrent_tasks: usize,
    /// Default per-invocation timeout
    pub task_timeout_secs: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: None,
            max_memory_mb: None,
            max_concurrent_tasks: 4,
            task_timeout_secs: 300.0,
        }
    }
}

impl ResourceLimits {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.task_timeout_secs)
    }

    /// Checks the limits for values the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(BenchError::Configuration(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !self.task_timeout_secs.is_finite() || self.task_timeout_secs <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "task_timeout_secs must be positive, got {}",
                self.task_timeout_secs
            )));
        }
        if let Some(cpu) = self.max_cpu_percent {
            if !(cpu > 0.0 && cpu <= 100.0) {
                return Err(BenchError::Configuration(format!(
                    "max_cpu_percent must be in (0, 100], got {}",
                    cpu
                )));
            }
        }
        if self.max_memory_mb == Some(0) {
            return Err(BenchError::Configuration(
                "max_memory_mb must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Starting worker count (defaults to logical cores capped by the ceiling)
    pub initial: Option<usize>,
    /// Auto-scaling floor
    pub min: usize,
    /// Auto-scaling ceiling
    pub max: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            initial: None,
            min: 1,
            max: logical_cores().max(1) * 2,
        }
    }
}

/// Used when the host's total memory cannot be read.
const FALLBACK_MEMORY_ALERT_MB: u64 = 8 * 1024;

fn default_memory_alert_mb() -> u64 {
    match host_memory_mb() {
        0 => FALLBACK_MEMORY_ALERT_MB,
        total => total / 10 * 9,
    }
}

/// Thresholds for the performance monitor's alert rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Failure fraction of the recent window
    pub failure_rate: f64,
    /// Busy workers divided by total workers
    pub pool_utilization: f64,
    /// Waiting tasks
    pub queue_depth: usize,
    /// Host used memory in megabytes (the monitor compares the whole
    /// machine, not just the benchmarked processes). Defaults to 90% of
    /// physical memory.
    pub memory_mb: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            failure_rate: 0.10,
            pool_utilization: 0.90,
            queue_depth: 100,
            memory_mb: default_memory_alert_mb(),
        }
    }
}

/// Performance monitor loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_ms: u64,
    /// Snapshots kept in the ring buffer
    pub history_capacity: usize,
    /// Snapshots written into the final report
    pub report_snapshots: usize,
    /// Snapshots that make up the "recent window" for failure-rate alerts
    pub failure_window: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            history_capacity: 600,
            report_snapshots: 50,
            failure_window: 10,
        }
    }
}

/// Rounds for an adaptive benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptivePlan {
    pub rounds: usize,
    pub tasks_per_round: usize,
    /// Mean queue wait above which a worker is added between rounds
    pub scale_up_wait_ms: u64,
    /// Mean queue wait below which a worker is removed between rounds
    pub scale_down_wait_ms: u64,
}

impl Default for AdaptivePlan {
    fn default() -> Self {
        Self {
            rounds: 3,
            tasks_per_round: 8,
            scale_up_wait_ms: 500,
            scale_down_wait_ms: 50,
        }
    }
}

/// Complete configuration consumed by the benchmark core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub execution_mode: ExecutionMode,
    pub scheduling_algorithm: SchedulingAlgorithm,
    pub limits: ResourceLimits,
    pub workers: WorkerSettings,
    pub auto_scaling: bool,
    pub scale_interval_ms: u64,
    pub sample_interval_ms: u64,
    /// Cap on captured stdout/stderr per stream
    pub output_cap_bytes: usize,
    /// Time between SIGTERM and SIGKILL on timeout
    pub kill_grace_ms: u64,
    /// Time in-flight tasks get to finish on shutdown
    pub shutdown_grace_ms: u64,
    pub alerts: AlertThresholds,
    pub monitor: MonitorSettings,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            scheduling_algorithm: SchedulingAlgorithm::default(),
            limits: ResourceLimits::default(),
            workers: WorkerSettings::default(),
            auto_scaling: false,
            scale_interval_ms: 2000,
            sample_interval_ms: 100,
            output_cap_bytes: 64 * 1024,
            kill_grace_ms: 2000,
            shutdown_grace_ms: 10_000,
            alerts: AlertThresholds::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl BenchConfig {
    /// Worker count the pool starts with.
    pub fn initial_workers(&self) -> usize {
        let requested = self
            .workers
            .initial
            .unwrap_or_else(|| logical_cores().min(self.limits.max_concurrent_tasks));
        requested.clamp(self.workers.min.max(1), self.workers.max.max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.workers.min == 0 {
            return Err(BenchError::Configuration("workers.min must be at least 1".into()));
        }
        if self.workers.min > self.workers.max {
            return Err(BenchError::Configuration(format!(
                "workers.min ({}) exceeds workers.max ({})",
                self.workers.min, self.workers.max
            )));
        }
        if self.sample_interval_ms == 0 || self.monitor.interval_ms == 0 {
            return Err(BenchError::Configuration(
                "sample and monitor intervals must be positive".into(),
            ));
        }
        if self.auto_scaling && self.scale_interval_ms == 0 {
            return Err(BenchError::Configuration(
                "scale_interval_ms must be positive when auto_scaling is on".into(),
            ));
        }
        if self.monitor.history_capacity == 0 {
            return Err(BenchError::Configuration(
                "monitor.history_capacity must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alerts.failure_rate)
            || !(0.0..=1.0).contains(&self.alerts.pool_utilization)
        {
            return Err(BenchError::Configuration(
                "alert rates must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduling_algorithm, SchedulingAlgorithm::Dynamic);
        assert_eq!(config.execution_mode, ExecutionMode::Threaded);
    }

    #[test]
    fn test_memory_alert_scales_with_host() {
        let threshold = AlertThresholds::default().memory_mb;
        match host_memory_mb() {
            0 => assert_eq!(threshold, FALLBACK_MEMORY_ALERT_MB),
            total => {
                assert!(threshold < total);
                assert!(threshold >= total / 2);
            }
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = BenchConfig::default();
        config.limits.max_concurrent_tasks = 0;
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));
    }

    #[test]
    fn test_cpu_ceiling_range() {
        let mut limits = ResourceLimits::default();
        limits.max_cpu_percent = Some(150.0);
        assert!(limits.validate().is_err());

        limits.max_cpu_percent = Some(80.0);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_worker_bounds() {
        let mut config = BenchConfig::default();
        config.workers.min = 5;
        config.workers.max = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_workers_clamped() {
        let mut config = BenchConfig::default();
        config.workers.initial = Some(50);
        config.workers.min = 1;
        config.workers.max = 6;
        assert_eq!(config.initial_workers(), 6);

        config.workers.initial = None;
        config.limits.max_concurrent_tasks = 1;
        assert_eq!(config.initial_workers(), 1);
    }

    #[test]
    fn test_execution_mode_from_str() {
        assert_eq!("hybrid".parse::<ExecutionMode>().unwrap(), ExecutionMode::Hybrid);
        assert_eq!("Threaded".parse::<ExecutionMode>().unwrap(), ExecutionMode::Threaded);
        assert!("process".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "limits:\n  max_concurrent_tasks: 2\nauto_scaling: true\n";
        let config: BenchConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.limits.max_concurrent_tasks, 2);
        assert!(config.auto_scaling);
        assert_eq!(config.limits.task_timeout_secs, 300.0);
        assert_eq!(config.alerts.failure_rate, 0.10);
    }
}
