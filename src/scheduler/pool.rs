//! Worker Pool
//!
//! A bounded set of OS-thread workers fed from a priority queue:
//! - Admission gated by the concurrency ceiling and host CPU/memory ceilings
//! - Placement by the selected [`SchedulingAlgorithm`]
//! - Retries of timeouts and transient failures
//! - Optional auto-scaling between a floor and a ceiling
//! - Graceful shutdown with a grace period, then force-cancellation
//!
//! All cross-worker state (queues, worker slots, counters) lives behind one
//! mutex; workers sleep on a condition variable between tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;

use super::autoscale::{AutoScaler, ScaleDecision};
use super::placement::{self, SchedulingAlgorithm, WorkerLoad, WorkerState};
use super::queue::PriorityQueue;
use crate::config::{BenchConfig, ExecutionMode, ResourceLimits};
use crate::error::{BenchError, FailureKind, Result};
use crate::execution::collector::{PerformanceCollector, PerformanceMetrics};
use crate::execution::task::{Task, TaskId, TaskStatus};
use crate::execution::tracker::{CommandStats, ExecutionRecord, ProcessExecutionTracker};
use crate::monitoring::resource::{ResourceUsage, SampleTarget, SamplerHandle};
use crate::monitoring::timeline::{EventType, ExecutionTimeline};

/// How often waiting workers re-check admission (host load changes silently).
const ADMISSION_RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Interval of the host sampler used for resource ceilings.
const HOST_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const SHUTDOWN_CANCEL_REASON: &str = "cancelled: pool shutting down";
const GRACE_EXPIRED_REASON: &str = "cancelled: shutdown grace period expired";

/// Final result of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub objective: String,
    pub strategy: Option<String>,
    pub status: TaskStatus,
    /// Record of the final attempt
    pub record: ExecutionRecord,
    pub metrics: PerformanceMetrics,
    /// Classification of the final attempt, `None` on success
    pub failure: Option<FailureKind>,
    /// Human-readable failure reason
    pub reason: Option<String>,
    /// Worker that ran the task, `None` if it never started
    pub worker_id: Option<usize>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Outcome for a task that never reached a worker's execution step.
    fn not_run(task: Task, kind: FailureKind, reason: &str, worker_id: Option<usize>) -> Self {
        let record = ExecutionRecord::not_started(task.command, reason, kind == FailureKind::Cancelled);
        let collector = PerformanceCollector::new(task.id.to_string(), task.created_at);
        let metrics = collector.stop_collection(&record, 0);

        Self {
            task_id: task.id,
            objective: task.objective,
            strategy: task.strategy,
            status: TaskStatus::Failure,
            record,
            metrics,
            failure: Some(kind),
            reason: Some(reason.to_string()),
            worker_id,
        }
    }
}

/// Handle to a submitted task's eventual outcome.
pub struct TaskHandle {
    id: TaskId,
    task: Task,
    rx: Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(self) -> TaskOutcome {
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("{} lost: its worker exited without reporting", self.id);
                TaskOutcome::not_run(self.task, FailureKind::Fatal, "worker exited without a result", None)
            }
        }
    }

    /// Waits up to `timeout`; `None` if the task is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(TaskOutcome::not_run(
                self.task.clone(),
                FailureKind::Fatal,
                "worker exited without a result",
                None,
            )),
        }
    }
}

/// Execution counters reported by [`WorkerPool::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub submitted: u64,
    /// Tasks that reached a terminal state
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_execution_time_secs: f64,
    /// Tasks that reached a worker (excludes tasks cancelled while queued)
    pub executed: u64,
    pub total_execution_time_secs: f64,
    /// Most workers executing at the same time
    pub peak_workers: usize,
    /// Tasks admitted or waiting but not executing
    pub queue_length: usize,
    pub active_workers: usize,
    pub worker_count: usize,
    pub retries: u64,
}

impl PoolMetrics {
    /// Counters accumulated since `earlier`; gauges keep their current values.
    pub fn since(&self, earlier: &PoolMetrics) -> PoolMetrics {
        let total = self.total.saturating_sub(earlier.total);
        let completed = self.completed.saturating_sub(earlier.completed);
        let executed = self.executed.saturating_sub(earlier.executed);
        let total_execution_time_secs =
            (self.total_execution_time_secs - earlier.total_execution_time_secs).max(0.0);

        PoolMetrics {
            submitted: self.submitted.saturating_sub(earlier.submitted),
            total,
            completed,
            failed: self.failed.saturating_sub(earlier.failed),
            success_rate: if total == 0 { 0.0 } else { completed as f64 / total as f64 },
            avg_execution_time_secs: if executed == 0 {
                0.0
            } else {
                total_execution_time_secs / executed as f64
            },
            executed,
            total_execution_time_secs,
            retries: self.retries.saturating_sub(earlier.retries),
            ..*self
        }
    }

    /// Busy workers divided by workers.
    pub fn utilization(&self) -> f64 {
        if self.worker_count == 0 {
            0.0
        } else {
            self.active_workers as f64 / self.worker_count as f64
        }
    }
}

/// Load distribution reported by [`WorkerPool::scheduling_metrics`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingMetrics {
    pub algorithm: SchedulingAlgorithm,
    pub load_balance_score: f64,
    pub min_worker_load: u64,
    pub max_worker_load: u64,
    /// Completed task count per worker id
    pub per_worker: Vec<u64>,
}

impl SchedulingMetrics {
    fn from_loads(algorithm: SchedulingAlgorithm, per_worker: Vec<u64>) -> Self {
        Self {
            algorithm,
            load_balance_score: placement::load_balance_score(&per_worker),
            min_worker_load: per_worker.iter().copied().min().unwrap_or(0),
            max_worker_load: per_worker.iter().copied().max().unwrap_or(0),
            per_worker,
        }
    }

    /// Distribution of the tasks completed since `earlier`.
    pub fn since(&self, earlier: &SchedulingMetrics) -> SchedulingMetrics {
        let per_worker = self
            .per_worker
            .iter()
            .enumerate()
            .map(|(id, done)| done.saturating_sub(earlier.per_worker.get(id).copied().unwrap_or(0)))
            .collect();
        Self::from_loads(self.algorithm, per_worker)
    }
}

/// What [`WorkerPool::shutdown`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Tasks cancelled before they started
    pub cancelled_queued: usize,
    /// In-flight tasks killed after the grace period
    pub force_cancelled: usize,
}

/// A task waiting in a queue.
struct Job {
    task: Task,
    status: TaskStatus,
    result_tx: Sender<TaskOutcome>,
}

impl Job {
    fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BenchError::FatalScheduling(format!(
                "{} cannot move from {:?} to {:?}",
                self.task.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    fn finish(mut self, outcome: TaskOutcome) {
        if let Err(e) = self.advance(outcome.status) {
            error!("{}", e);
        }
        if self.result_tx.send(outcome).is_err() {
            debug!("Result for {} dropped: handle no longer held", self.task.id);
        }
    }
}

struct WorkerSlot {
    state: WorkerState,
    local: VecDeque<Job>,
    completed: u64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            state: WorkerState::Idle,
            local: VecDeque::new(),
            completed: 0,
        }
    }

    /// Idle or Assigned depending on the local queue.
    fn settle(&mut self) {
        if matches!(self.state, WorkerState::Idle | WorkerState::Assigned | WorkerState::Executing) {
            self.state = if self.local.is_empty() {
                WorkerState::Idle
            } else {
                WorkerState::Assigned
            };
        }
    }
}

struct PoolState {
    queue: PriorityQueue<Job>,
    workers: Vec<WorkerSlot>,
    /// Tasks currently executing, for double-dispatch detection
    running: HashSet<TaskId>,
    /// Tasks admitted past the ceiling check (local queues + executing)
    admitted: usize,
    rr_cursor: usize,
    shutting_down: bool,
    submitted: u64,
    finished: u64,
    succeeded: u64,
    failed: u64,
    executed: u64,
    retries: u64,
    execution_secs: f64,
    peak_workers: usize,
    timeline: ExecutionTimeline,
    autoscaler: AutoScaler,
}

impl PoolState {
    fn loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .enumerate()
            .map(|(id, slot)| WorkerLoad {
                id,
                state: slot.state,
                queued: slot.local.len(),
            })
            .collect()
    }

    fn executing(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.state == WorkerState::Executing)
            .count()
    }

    fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.state != WorkerState::Retired)
            .count()
    }

    fn waiting(&self) -> usize {
        self.queue.len() + self.workers.iter().map(|slot| slot.local.len()).sum::<usize>()
    }

    /// Own local queue first, then (work-stealing only) the back of the busiest queue.
    fn take_job(&mut self, worker: usize, algorithm: SchedulingAlgorithm) -> Option<Job> {
        if let Some(job) = self.workers[worker].local.pop_front() {
            return Some(job);
        }

        if algorithm != SchedulingAlgorithm::WorkStealing {
            return None;
        }

        let victim = placement::steal_victim(&self.loads(), worker)?;
        let job = self.workers[victim].local.pop_back()?;
        if self.workers[victim].state == WorkerState::Assigned {
            self.workers[victim].settle();
        }
        debug!("Worker {} stole {} from worker {}", worker, job.task.id, victim);
        Some(job)
    }

    fn record_outcome(&mut self, outcome: &TaskOutcome) {
        self.finished += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if outcome.worker_id.is_some() {
            self.executed += 1;
            self.execution_secs += outcome.metrics.execution_time_secs;
        }
    }
}

/// Either a per-worker runtime or a handle to the shared one.
enum WorkerRuntime {
    Local(Runtime),
    Shared(Handle),
}

impl WorkerRuntime {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Self::Local(runtime) => runtime.block_on(future),
            Self::Shared(handle) => handle.block_on(future),
        }
    }
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
    limits: RwLock<ResourceLimits>,
    algorithm: SchedulingAlgorithm,
    mode: ExecutionMode,
    max_workers: usize,
    tracker: ProcessExecutionTracker,
    runtime: Option<Runtime>,
    host: SamplerHandle,
    cancel_tx: watch::Sender<bool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limits(&self) -> ResourceLimits {
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn resources_exhausted(&self, limits: &ResourceLimits) -> bool {
        let Some(host) = self.host.current() else {
            return false;
        };

        if let Some(max_cpu) = limits.max_cpu_percent {
            if host.cpu_percent > max_cpu {
                debug!("Admission held: host CPU {:.1}% > {:.1}%", host.cpu_percent, max_cpu);
                return true;
            }
        }
        if let Some(max_mb) = limits.max_memory_mb {
            if host.memory_mb() > max_mb as f64 {
                debug!("Admission held: host memory {:.0} MB > {} MB", host.memory_mb(), max_mb);
                return true;
            }
        }
        false
    }

    /// Admits queued tasks while the ceilings allow and placement finds a worker.
    ///
    /// Never admits more tasks than there are workers: a task sitting in a
    /// local queue behind a busy worker would bypass the priority queue, so
    /// everything that cannot start right away stays in the global queue.
    fn dispatch(&self, state: &mut PoolState) {
        if state.shutting_down || state.queue.is_empty() {
            return;
        }

        let limits = self.limits();
        while !state.queue.is_empty() {
            let capacity = limits.max_concurrent_tasks.min(state.active_workers());
            if state.admitted >= capacity {
                break;
            }
            // With nothing admitted, external host load must not starve the queue
            if state.admitted > 0 && self.resources_exhausted(&limits) {
                break;
            }

            let loads = state.loads();
            let Some(worker) = placement::place(self.algorithm, &loads, &mut state.rr_cursor) else {
                break;
            };
            let Some(job) = state.queue.pop() else {
                break;
            };

            debug!(
                "Admitted {} (priority {}) to worker {}",
                job.task.id, job.task.priority, worker
            );
            state.admitted += 1;
            let slot = &mut state.workers[worker];
            slot.local.push_back(job);
            if slot.state == WorkerState::Idle {
                slot.state = WorkerState::Assigned;
            }
        }
    }

    fn worker_runtime(&self) -> Result<WorkerRuntime> {
        match (&self.runtime, self.mode) {
            (Some(runtime), ExecutionMode::Hybrid) => Ok(WorkerRuntime::Shared(runtime.handle().clone())),
            _ => Ok(WorkerRuntime::Local(
                Builder::new_current_thread().enable_all().build()?,
            )),
        }
    }

    /// Blocks until a job is available for `worker`; `None` once it should exit.
    fn next_job(&self, worker: usize) -> Option<Job> {
        let mut state = self.lock_state();
        loop {
            if state.workers[worker].state == WorkerState::Retired {
                return None;
            }

            self.dispatch(&mut state);

            if let Some(mut job) = state.take_job(worker, self.algorithm) {
                if !state.running.insert(job.task.id) {
                    let message = format!("{} dispatched while already executing", job.task.id);
                    error!("Fatal scheduling error: {}", message);
                    state.admitted = state.admitted.saturating_sub(1);
                    state.workers[worker].settle();

                    let task = job.task.clone();
                    let outcome = TaskOutcome::not_run(task, FailureKind::Fatal, &message, Some(worker));
                    state.record_outcome(&outcome);
                    job.status = TaskStatus::Running;
                    job.finish(outcome);
                    continue;
                }

                if let Err(e) = job.advance(TaskStatus::Running) {
                    error!("{}", e);
                }

                state.workers[worker].state = WorkerState::Executing;
                state.autoscaler.record_wait(job.task.created_at.elapsed());
                state.timeline.add_event(job.task.id, worker, EventType::Started);
                let executing = state.executing();
                state.peak_workers = state.peak_workers.max(executing);
                return Some(job);
            }

            if state.shutting_down {
                state.workers[worker].state = WorkerState::Retired;
                return None;
            }

            state = self
                .available
                .wait_timeout(state, ADMISSION_RECHECK_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Runs a job, retrying retryable failures, and reports its outcome.
    fn run_job(&self, worker: usize, job: Job, runtime: &WorkerRuntime) {
        let task = job.task.clone();
        let mut collector = PerformanceCollector::new(task.id.to_string(), task.created_at);
        collector.start_collection();

        let cancel = self.cancel_tx.subscribe();
        let mut retries = 0u32;

        let (record, failure) = loop {
            let attempt = runtime.block_on(self.tracker.execute_command_async(
                &task.command,
                task.timeout,
                Some(cancel.clone()),
            ));

            let (record, failure) = match attempt {
                Ok(record) => {
                    let failure = record.failure_kind();
                    (record, failure)
                }
                Err(e) => {
                    let kind = match e {
                        BenchError::Spawn { .. } => FailureKind::Spawn,
                        _ => FailureKind::Fatal,
                    };
                    warn!("{} could not start: {}", task.id, e);
                    (
                        ExecutionRecord::not_started(task.command.clone(), &e.to_string(), false),
                        Some(kind),
                    )
                }
            };

            collector.exclude_teardown(&record);

            let event = match failure {
                None => EventType::Succeeded,
                Some(FailureKind::Timeout) => EventType::TimedOut,
                Some(_) => EventType::Failed,
            };

            let retry = {
                let mut state = self.lock_state();
                state.timeline.add_event(task.id, worker, event);
                let retry = failure.map(FailureKind::is_retryable).unwrap_or(false)
                    && retries < task.max_retries
                    && !state.shutting_down;
                if retry {
                    state.retries += 1;
                    state.timeline.add_event(task.id, worker, EventType::Started);
                }
                retry
            };

            if !retry {
                break (record, failure);
            }

            retries += 1;
            if let Some(kind) = failure {
                warn!(
                    "{} failed ({}), retry {}/{}",
                    task.id, kind, retries, task.max_retries
                );
            }
        };

        let metrics = collector.stop_collection(&record, retries);
        let status = if record.success {
            TaskStatus::Success
        } else if record.timed_out {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failure
        };

        let reason = failure.map(|kind| describe_failure(kind, &task, &record, retries));
        match &reason {
            None => info!(
                "{} succeeded in {:.2?} on worker {}",
                task.id,
                metrics.execution_time(),
                worker
            ),
            Some(reason) => warn!("{} failed: {}", task.id, reason),
        }

        let outcome = TaskOutcome {
            task_id: task.id,
            objective: task.objective,
            strategy: task.strategy,
            status,
            record,
            metrics,
            failure,
            reason,
            worker_id: Some(worker),
        };

        {
            let mut state = self.lock_state();
            state.running.remove(&task.id);
            state.admitted = state.admitted.saturating_sub(1);
            let slot = &mut state.workers[worker];
            slot.completed += 1;
            slot.settle();
            state.record_outcome(&outcome);
            self.dispatch(&mut state);
        }
        self.available.notify_all();

        job.finish(outcome);
    }

    /// Retires the highest-numbered idle worker, keeping at least `floor`.
    fn retire_idle_worker(&self) -> bool {
        let retired = {
            let mut state = self.lock_state();
            if state.active_workers() <= state.autoscaler.floor() {
                return false;
            }

            let candidate = state
                .workers
                .iter()
                .rposition(|slot| slot.state == WorkerState::Idle && slot.local.is_empty());

            match candidate {
                Some(id) => {
                    state.workers[id].state = WorkerState::Retired;
                    info!("Retiring worker {} ({} remain)", id, state.active_workers());
                    true
                }
                None => false,
            }
        };

        if retired {
            self.available.notify_all();
        }
        retired
    }
}

fn describe_failure(kind: FailureKind, task: &Task, record: &ExecutionRecord, retries: u32) -> String {
    let detail = record
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();

    let base = match kind {
        FailureKind::Timeout => format!("timed out after {:.2?}", task.timeout),
        FailureKind::Exit | FailureKind::Transient => match record.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        },
        FailureKind::Cancelled => GRACE_EXPIRED_REASON.to_string(),
        FailureKind::Rejected => "rejected at submission".to_string(),
        FailureKind::Spawn | FailureKind::Fatal => String::new(),
    };

    let mut reason = match (base.is_empty(), detail.is_empty()) {
        (true, _) => detail,
        (false, true) => base,
        (false, false) if kind == FailureKind::Cancelled => base,
        (false, false) => format!("{}: {}", base, detail),
    };

    if retries > 0 {
        reason.push_str(&format!(" (after {} retries)", retries));
    }
    reason
}

fn worker_loop(shared: Arc<Shared>, worker: usize, runtime: WorkerRuntime) {
    debug!("Worker {} started", worker);
    while let Some(job) = shared.next_job(worker) {
        shared.run_job(worker, job, &runtime);
    }
    debug!("Worker {} exited", worker);
}

fn spawn_worker(shared: &Arc<Shared>) -> Result<usize> {
    let runtime = shared.worker_runtime()?;

    let id = {
        let mut state = shared.lock_state();
        if state.active_workers() >= shared.max_workers {
            return Err(BenchError::Configuration(format!(
                "worker ceiling of {} reached",
                shared.max_workers
            )));
        }
        state.workers.push(WorkerSlot::new());
        state.workers.len() - 1
    };

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("worker-{}", id))
        .spawn(move || worker_loop(worker_shared, id, runtime));

    match spawned {
        Ok(handle) => {
            shared
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
            shared.available.notify_all();
            Ok(id)
        }
        Err(e) => {
            shared.lock_state().workers[id].state = WorkerState::Retired;
            Err(e.into())
        }
    }
}

fn spawn_autoscaler(shared: Arc<Shared>, interval: Duration) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = channel::<()>();

    let handle = thread::Builder::new()
        .name("autoscaler".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }

            let decision = {
                let mut state = shared.lock_state();
                if state.shutting_down {
                    break;
                }
                let workers = state.active_workers();
                let waiting = state.waiting();
                state.autoscaler.evaluate(workers, waiting)
            };

            match decision {
                ScaleDecision::Up => match spawn_worker(&shared) {
                    Ok(id) => info!("Auto-scaling added worker {}", id),
                    Err(e) => debug!("Auto-scaling could not add a worker: {}", e),
                },
                ScaleDecision::Down => {
                    shared.retire_idle_worker();
                }
                ScaleDecision::Hold => {}
            }
        })?;

    Ok((stop_tx, handle))
}

/// The scheduler: a pool of workers executing submitted tasks.
///
/// # Example
///
/// ```rust,no_run
/// use parabench::config::BenchConfig;
/// use parabench::execution::Task;
/// use parabench::scheduler::WorkerPool;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = WorkerPool::start(&BenchConfig::default())?;
///     let handle = pool.submit(Task::new(1, "hello", vec!["echo".into(), "hello".into()]))?;
///     let outcome = handle.wait();
///     println!("{:?}: {:?}", outcome.task_id, outcome.status);
///     Ok(())
/// }
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    autoscaler: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl WorkerPool {
    /// Validates `config` and starts the workers.
    pub fn start(config: &BenchConfig) -> Result<Self> {
        config.validate()?;

        let runtime = match config.execution_mode {
            ExecutionMode::Hybrid => Some(
                Builder::new_multi_thread()
                    .enable_all()
                    .thread_name("parabench-io")
                    .build()?,
            ),
            ExecutionMode::Threaded => None,
        };

        let tracker = ProcessExecutionTracker::new(config.sample_interval())
            .with_output_cap(config.output_cap_bytes)
            .with_kill_grace(config.kill_grace());

        let (cancel_tx, _) = watch::channel(false);

        let state = PoolState {
            queue: PriorityQueue::new(),
            workers: Vec::new(),
            running: HashSet::new(),
            admitted: 0,
            rr_cursor: 0,
            shutting_down: false,
            submitted: 0,
            finished: 0,
            succeeded: 0,
            failed: 0,
            executed: 0,
            retries: 0,
            execution_secs: 0.0,
            peak_workers: 0,
            timeline: ExecutionTimeline::new(),
            autoscaler: AutoScaler::new(config.workers.min, config.workers.max),
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            available: Condvar::new(),
            limits: RwLock::new(config.limits.clone()),
            algorithm: config.scheduling_algorithm,
            mode: config.execution_mode,
            max_workers: config.workers.max,
            tracker,
            runtime,
            host: SamplerHandle::spawn("host", SampleTarget::Host, HOST_SAMPLE_INTERVAL),
            cancel_tx,
            threads: Mutex::new(Vec::new()),
        });

        let pool = Self {
            shared,
            autoscaler: Mutex::new(None),
        };

        let initial = config.initial_workers();
        for _ in 0..initial {
            spawn_worker(&pool.shared)?;
        }

        if config.auto_scaling {
            let scaler = spawn_autoscaler(Arc::clone(&pool.shared), config.scale_interval())?;
            *pool.autoscaler.lock().unwrap_or_else(PoisonError::into_inner) = Some(scaler);
        }

        info!(
            "Worker pool started: {} workers, algorithm {}, mode {:?}, max concurrent {}",
            initial,
            config.scheduling_algorithm,
            config.execution_mode,
            config.limits.max_concurrent_tasks
        );

        Ok(pool)
    }

    /// Queues a task at its own priority.
    ///
    /// Invalid tasks are rejected here and never enqueued.
    pub fn submit(&self, task: Task) -> Result<TaskHandle> {
        task.validate()?;

        let (result_tx, rx) = channel();
        let handle = TaskHandle {
            id: task.id,
            task: task.clone(),
            rx,
        };

        {
            let mut state = self.shared.lock_state();
            if state.shutting_down {
                return Err(BenchError::Cancelled("pool is shutting down".into()));
            }

            let id = task.id;
            let priority = task.priority;
            state.submitted += 1;
            state.queue.push(
                Job {
                    task,
                    status: TaskStatus::Pending,
                    result_tx,
                },
                priority,
            );
            debug!("Queued {} (priority {}, {} waiting)", id, priority, state.queue.len());
            self.shared.dispatch(&mut state);
        }

        self.shared.available.notify_all();
        Ok(handle)
    }

    /// Queues a task with an explicit priority.
    pub fn submit_with_priority(&self, mut task: Task, priority: i32) -> Result<TaskHandle> {
        task.priority = priority;
        self.submit(task)
    }

    /// Execution counters.
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.lock_state();
        let success_rate = if state.finished == 0 {
            0.0
        } else {
            state.succeeded as f64 / state.finished as f64
        };
        let avg_execution_time_secs = if state.executed == 0 {
            0.0
        } else {
            state.execution_secs / state.executed as f64
        };

        PoolMetrics {
            submitted: state.submitted,
            total: state.finished,
            completed: state.succeeded,
            failed: state.failed,
            success_rate,
            avg_execution_time_secs,
            executed: state.executed,
            total_execution_time_secs: state.execution_secs,
            peak_workers: state.peak_workers,
            queue_length: state.waiting(),
            active_workers: state.executing(),
            worker_count: state.active_workers(),
            retries: state.retries,
        }
    }

    /// Per-worker load distribution.
    pub fn scheduling_metrics(&self) -> SchedulingMetrics {
        let state = self.shared.lock_state();
        let per_worker = state.workers.iter().map(|slot| slot.completed).collect();
        SchedulingMetrics::from_loads(self.shared.algorithm, per_worker)
    }

    /// Copy of the execution timeline.
    pub fn timeline(&self) -> ExecutionTimeline {
        self.shared.lock_state().timeline.clone()
    }

    /// Mean queue wait over the recent window.
    pub fn mean_queue_wait(&self) -> Option<Duration> {
        self.shared.lock_state().autoscaler.mean_wait()
    }

    /// Latest host resource snapshot.
    pub fn host_usage(&self) -> Option<ResourceUsage> {
        self.shared.host.current()
    }

    pub fn command_stats(&self) -> HashMap<String, CommandStats> {
        self.shared.tracker.command_stats()
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.shared.algorithm
    }

    pub fn limits(&self) -> ResourceLimits {
        self.shared.limits()
    }

    /// Replaces the resource ceilings. Running tasks are never preempted;
    /// only later admissions see the new values.
    pub fn set_limits(&self, limits: ResourceLimits) -> Result<()> {
        limits.validate()?;
        info!(
            "Resource limits updated: max concurrent {}, cpu {:?}, memory {:?} MB",
            limits.max_concurrent_tasks, limits.max_cpu_percent, limits.max_memory_mb
        );
        *self
            .shared
            .limits
            .write()
            .unwrap_or_else(PoisonError::into_inner) = limits;

        {
            let mut state = self.shared.lock_state();
            self.shared.dispatch(&mut state);
        }
        self.shared.available.notify_all();
        Ok(())
    }

    /// Workers that have not retired.
    pub fn worker_count(&self) -> usize {
        self.shared.lock_state().active_workers()
    }

    /// Adds one worker; fails at the configured ceiling.
    pub fn add_worker(&self) -> Result<usize> {
        if self.shared.lock_state().shutting_down {
            return Err(BenchError::Cancelled("pool is shutting down".into()));
        }
        let id = spawn_worker(&self.shared)?;
        info!("Added worker {}", id);
        Ok(self.worker_count())
    }

    /// Retires one idle worker. Returns false when none can go (all busy or at the floor).
    pub fn remove_worker(&self) -> bool {
        self.shared.retire_idle_worker()
    }

    fn stop_autoscaler(&self) {
        let scaler = self
            .autoscaler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some((stop_tx, handle)) = scaler {
            drop(stop_tx);
            if handle.join().is_err() {
                error!("Auto-scaler thread panicked");
            }
        }
    }

    /// Stops the pool.
    ///
    /// Queued tasks are cancelled at once; in-flight tasks get `grace` to
    /// finish before their processes are killed. Worker threads are joined.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.stop_autoscaler();

        let mut report = ShutdownReport::default();
        {
            let mut state = self.shared.lock_state();
            state.shutting_down = true;

            let mut cancelled = state.queue.drain_ordered();
            let unadmitted = cancelled.len();
            for slot in state.workers.iter_mut() {
                cancelled.extend(slot.local.drain(..));
                if slot.state == WorkerState::Assigned {
                    slot.state = WorkerState::Idle;
                }
            }
            state.admitted = state.executing();
            debug!(
                "Cancelling {} waiting tasks ({} already admitted)",
                cancelled.len(),
                cancelled.len() - unadmitted
            );

            report.cancelled_queued = cancelled.len();
            for job in cancelled {
                let outcome =
                    TaskOutcome::not_run(job.task.clone(), FailureKind::Cancelled, SHUTDOWN_CANCEL_REASON, None);
                state.record_outcome(&outcome);
                job.finish(outcome);
            }
        }
        self.shared.available.notify_all();

        let deadline = Instant::now() + grace;
        let mut state = self.shared.lock_state();
        while state.executing() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let remaining = state.executing();
        drop(state);

        if remaining > 0 {
            warn!(
                "{} tasks still running after {:.2?} grace period, cancelling",
                remaining, grace
            );
            self.shared.cancel_tx.send_replace(true);
            report.force_cancelled = remaining;
        }

        let threads = std::mem::take(
            &mut *self
                .shared
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in threads {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        if report.cancelled_queued > 0 || report.force_cancelled > 0 {
            info!(
                "Pool shut down: {} queued tasks cancelled, {} force-cancelled",
                report.cancelled_queued, report.force_cancelled
            );
        }
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}
