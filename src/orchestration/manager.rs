//! Orchestration Manager
//!
//! Turns objectives into tasks, drives them through the worker pool, feeds
//! every outcome into the metrics aggregator, and assembles the suite result.
//!
//! # Adaptive runs
//!
//! [`OrchestrationManager::run_adaptive_benchmark`] repeats one objective in
//! rounds. Between rounds the queue waits of the finished round decide at
//! most one scaling step, so workers are never added or removed mid-task.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{AdaptivePlan, BenchConfig};
use crate::error::{BenchError, FailureKind, Result};
use crate::execution::collector::PerformanceMetrics;
use crate::execution::task::{Objective, TaskId, TaskStatus, TaskTemplate};
use crate::metrics::{AggregatedReport, MetricsAggregator, TaskReport};
use crate::monitoring::resource::{ResourceRollup, DEFAULT_SAMPLE_INTERVAL};
use crate::scheduler::{
    AutoScaler, PoolMetrics, ScaleDecision, SchedulingMetrics, ShutdownReport, TaskHandle, TaskOutcome,
    WorkerPool,
};

/// Label of the host monitor attached to every suite session.
const SUITE_MONITOR_LABEL: &str = "suite-host";

/// A task that did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub objective: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub kind: Option<FailureKind>,
    pub reason: String,
}

impl From<&TaskReport> for TaskFailure {
    fn from(report: &TaskReport) -> Self {
        Self {
            task_id: report.task_id,
            objective: report.objective.clone(),
            status: report.status,
            exit_code: report.exit_code,
            kind: report.failure,
            reason: report
                .reason
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
        }
    }
}

/// One round of an adaptive run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    pub round: usize,
    /// Workers during the round
    pub workers: usize,
    pub completed: u64,
    pub failed: u64,
    pub mean_queue_wait_secs: f64,
    /// Scaling step taken after the round
    pub decision: String,
}

/// Everything a suite run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteResult {
    pub duration_secs: f64,
    /// Completed tasks per second
    pub throughput: f64,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub failures: Vec<TaskFailure>,
    pub execution_metrics: PoolMetrics,
    pub scheduling_metrics: SchedulingMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rounds: Vec<RoundSummary>,
    pub report: AggregatedReport,
}

impl SuiteResult {
    fn from_report(
        report: AggregatedReport,
        pool: &WorkerPool,
        baseline: &SessionBaseline,
        rounds: Vec<RoundSummary>,
    ) -> Self {
        let throughput = if report.duration > 0.0 {
            report.completed_tasks as f64 / report.duration
        } else {
            0.0
        };

        Self {
            duration_secs: report.duration,
            throughput,
            total: report.total_tasks,
            completed: report.completed_tasks,
            failed: report.failed_tasks,
            failures: report.failures().map(TaskFailure::from).collect(),
            execution_metrics: pool.metrics().since(&baseline.execution),
            scheduling_metrics: pool.scheduling_metrics().since(&baseline.scheduling),
            rounds,
            report,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    pub fn success_rate(&self) -> f64 {
        self.report.success_rate
    }
}

/// Pool counters when a suite started, so results only cover that suite.
#[derive(Debug, Clone, Default)]
struct SessionBaseline {
    execution: PoolMetrics,
    scheduling: SchedulingMetrics,
}

/// Drives benchmark suites.
///
/// # Example
///
/// ```rust,no_run
/// use parabench::config::BenchConfig;
/// use parabench::execution::{Objective, TaskTemplate};
/// use parabench::orchestration::OrchestrationManager;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut manager = OrchestrationManager::new(BenchConfig::default());
///     manager.initialize()?;
///
///     let template = TaskTemplate::new(vec!["echo".into(), "{objective}".into()]);
///     let objectives = vec![Objective::new("first"), Objective::new("second")];
///     let result = manager.run_benchmark_suite(&objectives, &template)?;
///
///     println!("{}/{} succeeded", result.completed, result.total);
///     manager.shutdown();
///     Ok(())
/// }
/// ```
pub struct OrchestrationManager {
    config: BenchConfig,
    pool: Option<Arc<WorkerPool>>,
    aggregator: Arc<MetricsAggregator>,
    next_task_id: u64,
}

impl OrchestrationManager {
    pub fn new(config: BenchConfig) -> Self {
        let interval = Duration::from_millis(config.sample_interval_ms).max(DEFAULT_SAMPLE_INTERVAL);
        Self {
            config,
            pool: None,
            aggregator: Arc::new(MetricsAggregator::with_monitor_interval(interval)),
            next_task_id: 1,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Validates the configuration and starts the worker pool.
    ///
    /// Calling it again while the pool is running is a no-op.
    pub fn initialize(&mut self) -> Result<()> {
        if self.pool.is_some() {
            debug!("Orchestrator already initialized");
            return Ok(());
        }

        self.config.validate()?;
        let pool = WorkerPool::start(&self.config)?;
        info!(
            "Orchestrator initialized with {} workers ({})",
            pool.worker_count(),
            pool.algorithm()
        );
        self.pool = Some(Arc::new(pool));
        Ok(())
    }

    /// The running pool, if initialized.
    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.clone()
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.aggregator)
    }

    fn require_pool(&self) -> Result<Arc<WorkerPool>> {
        self.pool.clone().ok_or_else(|| {
            BenchError::Configuration("orchestrator is not initialized (call initialize first)".into())
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Submits one task per objective. Rejected tasks are recorded as
    /// failures immediately and produce no handle.
    fn submit_all(&mut self, pool: &WorkerPool, objectives: &[Objective], template: &TaskTemplate) -> Vec<TaskHandle> {
        let default_timeout = self.config.limits.task_timeout();
        let mut handles = Vec::with_capacity(objectives.len());

        for objective in objectives {
            let id = self.allocate_id();
            let task = template.to_task(id, objective, default_timeout);

            match pool.submit(task) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!("{} rejected: {}", TaskId(id), e);
                    self.aggregator.record_task(rejected_report(id, objective, &e));
                }
            }
        }

        debug!("Submitted {} of {} tasks", handles.len(), objectives.len());
        handles
    }

    fn wait_all(&self, handles: Vec<TaskHandle>) -> Vec<TaskOutcome> {
        handles
            .into_iter()
            .map(|handle| {
                let outcome = handle.wait();
                self.aggregator.record_outcome(&outcome);
                outcome
            })
            .collect()
    }

    fn begin_session(&self, pool: &WorkerPool) -> SessionBaseline {
        let baseline = SessionBaseline {
            execution: pool.metrics(),
            scheduling: pool.scheduling_metrics(),
        };
        self.aggregator.start_collection();
        if let Err(e) = self.aggregator.create_resource_monitor(SUITE_MONITOR_LABEL) {
            warn!("Host monitor unavailable: {}", e);
        }
        baseline
    }

    /// Runs one task per objective and waits for all of them.
    ///
    /// Individual task failures are reported in the result, never as `Err`.
    pub fn run_benchmark_suite(&mut self, objectives: &[Objective], template: &TaskTemplate) -> Result<SuiteResult> {
        let pool = self.require_pool()?;
        info!("Running benchmark suite: {} objectives", objectives.len());

        let baseline = self.begin_session(&pool);
        let handles = self.submit_all(&pool, objectives, template);
        self.wait_all(handles);
        let report = self.aggregator.stop_collection()?;

        let result = SuiteResult::from_report(report, &pool, &baseline, Vec::new());
        log_result(&result);
        Ok(result)
    }

    /// Runs `objective` repeatedly in rounds, scaling the pool between rounds.
    pub fn run_adaptive_benchmark(
        &mut self,
        objective: &Objective,
        template: &TaskTemplate,
        plan: &AdaptivePlan,
    ) -> Result<SuiteResult> {
        if plan.rounds == 0 || plan.tasks_per_round == 0 {
            return Err(BenchError::Configuration(
                "adaptive plan needs at least one round and one task per round".into(),
            ));
        }

        let pool = self.require_pool()?;
        let scale_up = Duration::from_millis(plan.scale_up_wait_ms);
        let scale_down = Duration::from_millis(plan.scale_down_wait_ms);
        let mut scaler = AutoScaler::new(self.config.workers.min, self.config.workers.max)
            .with_thresholds(scale_up, scale_down);

        info!(
            "Running adaptive benchmark: {} rounds of {} tasks",
            plan.rounds, plan.tasks_per_round
        );

        let baseline = self.begin_session(&pool);
        let objectives = vec![objective.clone(); plan.tasks_per_round];
        let mut rounds = Vec::with_capacity(plan.rounds);

        for round in 1..=plan.rounds {
            let workers = pool.worker_count();
            let handles = self.submit_all(&pool, &objectives, template);
            let outcomes = self.wait_all(handles);

            let waits: Vec<Duration> = outcomes.iter().map(|o| o.metrics.queue_time()).collect();
            for wait in &waits {
                scaler.record_wait(*wait);
            }
            let mean_wait = mean_duration(&waits);
            // Tasks that genuinely waited for a worker
            let backlog = waits.iter().filter(|w| **w > scale_down).count();

            let decision = if round < plan.rounds {
                let decision = scaler.evaluate(workers, backlog);
                apply_scaling(&pool, decision);
                decision
            } else {
                ScaleDecision::Hold
            };

            let completed = outcomes.iter().filter(|o| o.is_success()).count() as u64;
            info!(
                "Round {}/{}: {} workers, {}/{} succeeded, mean queue wait {:.2?}, {:?}",
                round,
                plan.rounds,
                workers,
                completed,
                outcomes.len(),
                mean_wait,
                decision
            );

            rounds.push(RoundSummary {
                round,
                workers,
                completed,
                failed: outcomes.len() as u64 - completed,
                mean_queue_wait_secs: mean_wait.as_secs_f64(),
                decision: format!("{:?}", decision).to_lowercase(),
            });
        }

        let report = self.aggregator.stop_collection()?;
        let result = SuiteResult::from_report(report, &pool, &baseline, rounds);
        log_result(&result);
        Ok(result)
    }

    /// Stops the pool with the configured grace period.
    pub fn shutdown(&mut self) -> Option<ShutdownReport> {
        self.shutdown_with_grace(self.config.shutdown_grace())
    }

    /// Cancels queued tasks, gives in-flight ones `grace`, then force-cancels.
    pub fn shutdown_with_grace(&mut self, grace: Duration) -> Option<ShutdownReport> {
        let pool = self.pool.take()?;

        if self.aggregator.is_collecting() {
            if let Err(e) = self.aggregator.stop_collection() {
                warn!("Failed to close metrics session: {}", e);
            }
        }

        let report = pool.shutdown(grace);
        info!("Orchestrator shut down");
        Some(report)
    }
}

impl Drop for OrchestrationManager {
    fn drop(&mut self) {
        self.shutdown_with_grace(Duration::ZERO);
    }
}

fn apply_scaling(pool: &WorkerPool, decision: ScaleDecision) {
    match decision {
        ScaleDecision::Up => match pool.add_worker() {
            Ok(count) => info!("Scaled up to {} workers", count),
            Err(e) => debug!("Scale up skipped: {}", e),
        },
        ScaleDecision::Down => {
            if pool.remove_worker() {
                info!("Scaled down to {} workers", pool.worker_count());
            }
        }
        ScaleDecision::Hold => {}
    }
}

fn mean_duration(values: &[Duration]) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.iter().sum::<Duration>() / values.len() as u32
}

fn rejected_report(id: u64, objective: &Objective, error: &BenchError) -> TaskReport {
    TaskReport {
        task_id: TaskId(id),
        objective: objective.text.clone(),
        strategy: objective.strategy.clone(),
        status: TaskStatus::Failure,
        exit_code: None,
        failure: Some(FailureKind::Rejected),
        reason: Some(error.to_string()),
        worker_id: None,
        metrics: PerformanceMetrics {
            error_rate: 1.0,
            ..Default::default()
        },
        output_lines: 0,
        resources: ResourceRollup::default(),
        quality_score: None,
    }
}

fn log_result(result: &SuiteResult) {
    info!(
        "Suite finished in {:.2?}: {} total, {} completed, {} failed ({:.1} tasks/s)",
        result.duration(),
        result.total,
        result.completed,
        result.failed,
        result.throughput
    );
    for failure in &result.failures {
        debug!("{} failed: {}", failure.task_id, failure.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn config(max_concurrent: usize) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.limits.max_concurrent_tasks = max_concurrent;
        config.workers.initial = Some(max_concurrent);
        config.workers.max = max_concurrent + 2;
        config.sample_interval_ms = 20;
        config
    }

    #[test]
    fn test_run_requires_initialize() {
        let mut manager = OrchestrationManager::new(config(2));
        let template = TaskTemplate::new(sh("true"));
        let result = manager.run_benchmark_suite(&[Objective::new("a")], &template);
        assert!(matches!(result, Err(BenchError::Configuration(_))));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();
        let pool = manager.pool().unwrap();
        manager.initialize().unwrap();
        assert!(Arc::ptr_eq(&pool, &manager.pool().unwrap()));
    }

    #[test]
    fn test_invalid_config_fails_initialize() {
        let mut bad = config(2);
        bad.workers.min = 0;
        let mut manager = OrchestrationManager::new(bad);
        assert!(manager.initialize().is_err());
        assert!(manager.pool().is_none());
    }

    #[test]
    fn test_suite_substitutes_objectives() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();

        let template = TaskTemplate::new(sh("test '{objective}' = alpha"));
        let objectives = vec![Objective::new("alpha"), Objective::new("beta")];
        let result = manager.run_benchmark_suite(&objectives, &template).unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.completed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].objective, "beta");
        assert_eq!(result.failures[0].exit_code, Some(1));
        assert!(result.throughput > 0.0);
        assert_eq!(result.report.rebuild(), result.report);
    }

    #[test]
    fn test_parallel_sleep_suite() {
        let mut manager = OrchestrationManager::new(config(4));
        manager.initialize().unwrap();

        let template = TaskTemplate::new(sh("sleep 0.1"));
        let objectives: Vec<_> = (0..10).map(|i| Objective::new(format!("nap {}", i))).collect();
        let result = manager.run_benchmark_suite(&objectives, &template).unwrap();

        assert_eq!(result.completed, 10);
        assert_eq!(result.failed, 0);
        assert_eq!(result.success_rate(), 1.0);
        assert_eq!(result.report.success_rate, 1.0);
        // Three waves of at most four: about 0.3s
        assert!(result.duration_secs >= 0.25, "took {:.3}s", result.duration_secs);
        assert!(result.duration_secs < 0.8, "took {:.3}s", result.duration_secs);
        assert!(result.execution_metrics.peak_workers <= 4);
        assert!(result.execution_metrics.peak_workers >= 2);
    }

    #[test]
    fn test_failing_exits_reported_per_task() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();

        let template = TaskTemplate::new(sh("case '{objective}' in bad*) exit 3;; esac"));
        let objectives = vec![
            Objective::new("ok-1"),
            Objective::new("bad-1"),
            Objective::new("ok-2"),
            Objective::new("bad-2"),
            Objective::new("ok-3"),
        ];
        let result = manager.run_benchmark_suite(&objectives, &template).unwrap();

        assert_eq!(result.completed, 3);
        assert_eq!(result.failed, 2);
        assert_eq!(result.report.failed_tasks, 2);
        for task in result.report.failures() {
            assert!(task.objective.starts_with("bad"));
            assert_eq!(task.exit_code, Some(3));
            assert_eq!(task.failure, Some(FailureKind::Exit));
        }
    }

    #[test]
    fn test_rejected_tasks_count_as_failed() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();

        // Renders to an empty program name
        let template = TaskTemplate::new(vec!["{strategy}".to_string()]);
        let result = manager
            .run_benchmark_suite(&[Objective::new("x")], &template)
            .unwrap();

        assert_eq!(result.total, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].kind, Some(FailureKind::Rejected));
    }

    #[test]
    fn test_task_ids_unique_across_suites() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();
        let template = TaskTemplate::new(sh("true"));

        let first = manager.run_benchmark_suite(&[Objective::new("a")], &template).unwrap();
        let second = manager.run_benchmark_suite(&[Objective::new("b")], &template).unwrap();

        assert_ne!(first.report.per_task[0].task_id, second.report.per_task[0].task_id);
    }

    #[test]
    fn test_execution_metrics_cover_one_suite() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();

        let failing = TaskTemplate::new(sh("exit 1"));
        let objectives = vec![Objective::new("a"), Objective::new("b"), Objective::new("c")];
        let first = manager.run_benchmark_suite(&objectives, &failing).unwrap();
        assert_eq!(first.execution_metrics.total, 3);
        assert_eq!(first.execution_metrics.failed, 3);

        let passing = TaskTemplate::new(sh("true"));
        let second = manager
            .run_benchmark_suite(&[Objective::new("d")], &passing)
            .unwrap();
        assert_eq!(second.execution_metrics.total, 1);
        assert_eq!(second.execution_metrics.completed, 1);
        assert_eq!(second.execution_metrics.failed, 0);
        assert_eq!(second.execution_metrics.success_rate, 1.0);
        assert_eq!(second.execution_metrics.executed, 1);
        assert_eq!(second.scheduling_metrics.per_worker.iter().sum::<u64>(), 1);
        assert_eq!(second.success_rate(), 1.0);
    }

    #[test]
    fn test_adaptive_rounds() {
        let mut manager = OrchestrationManager::new(config(2));
        manager.initialize().unwrap();

        let plan = AdaptivePlan {
            rounds: 2,
            tasks_per_round: 3,
            ..Default::default()
        };
        let template = TaskTemplate::new(sh("true"));
        let result = manager
            .run_adaptive_benchmark(&Objective::new("repeat"), &template, &plan)
            .unwrap();

        assert_eq!(result.rounds.len(), 2);
        assert_eq!(result.total, 6);
        assert_eq!(result.completed, 6);
        assert_eq!(result.rounds[1].decision, "hold");
    }

    #[test]
    fn test_adaptive_rejects_empty_plan() {
        let mut manager = OrchestrationManager::new(config(1));
        manager.initialize().unwrap();
        let plan = AdaptivePlan {
            rounds: 0,
            ..Default::default()
        };
        let template = TaskTemplate::new(sh("true"));
        assert!(manager
            .run_adaptive_benchmark(&Objective::new("x"), &template, &plan)
            .is_err());
    }

    #[test]
    fn test_shutdown_once() {
        let mut manager = OrchestrationManager::new(config(1));
        manager.initialize().unwrap();
        assert!(manager.shutdown().is_some());
        assert!(manager.shutdown().is_none());
        assert!(manager.pool().is_none());
    }
}
