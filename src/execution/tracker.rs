//! Process Execution Tracking
//!
//! Runs one external-tool invocation, samples its resource usage for its
//! whole lifetime and enforces the timeout:
//! - On timeout the process tree gets SIGTERM, a grace period, then SIGKILL
//! - stdout/stderr are captured up to a cap and truncated with a marker
//! - Per-command statistics are accumulated for reporting

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, Signal, System};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{BenchError, FailureKind, Result};
use crate::monitoring::resource::{ResourceRollup, SampleTarget, SamplerHandle};

/// Default cap on captured bytes per stream.
pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for output pipes after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

/// Outcome of one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// argv that was executed
    pub command: Vec<String>,
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Captured stdout (bounded)
    pub stdout: String,
    /// Captured stderr (bounded)
    pub stderr: String,
    /// Lines written to stdout and stderr, including truncated ones
    pub output_lines: u64,
    /// Wall-clock time from spawn to exit, or to the timeout firing
    pub duration: Duration,
    /// Time spent after that point terminating the process and draining output
    pub teardown: Duration,
    /// Process resource rollup
    pub resources: ResourceRollup,
}

impl ExecutionRecord {
    /// Record for an attempt that never produced a process.
    pub fn not_started(command: Vec<String>, reason: &str, cancelled: bool) -> Self {
        Self {
            command,
            exit_code: None,
            success: false,
            timed_out: false,
            cancelled,
            stdout: String::new(),
            stderr: reason.to_string(),
            output_lines: 0,
            duration: Duration::ZERO,
            teardown: Duration::ZERO,
            resources: ResourceRollup::default(),
        }
    }

    /// Whether the attempt was cut short by a timeout or cancellation.
    pub fn interrupted(&self) -> bool {
        self.timed_out || self.cancelled
    }

    /// Why the attempt failed, `None` on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            None
        } else if self.cancelled {
            Some(FailureKind::Cancelled)
        } else if self.timed_out {
            Some(FailureKind::Timeout)
        } else {
            Some(FailureKind::classify_exit(self.exit_code, &self.stderr))
        }
    }

    /// Converts a failed record into the matching error.
    pub fn to_error(&self) -> Option<BenchError> {
        match self.failure_kind()? {
            FailureKind::Timeout => Some(BenchError::Timeout(self.duration)),
            FailureKind::Cancelled => Some(BenchError::Cancelled(self.stderr.clone())),
            FailureKind::Transient => Some(BenchError::TransientExecution {
                exit_code: self.exit_code,
                message: last_line(&self.stderr),
            }),
            _ => None,
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

/// Running statistics for one command signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStats {
    pub executions: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub total_duration_secs: f64,
}

impl CommandStats {
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }

    pub fn average_duration(&self) -> Duration {
        if self.executions == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total_duration_secs / self.executions as f64)
        }
    }

    fn record(&mut self, record: &ExecutionRecord) {
        self.executions += 1;
        if record.success {
            self.successes += 1;
        }
        if record.timed_out {
            self.timeouts += 1;
        }
        self.total_duration_secs += record.duration.as_secs_f64();
    }
}

/// Normalized key for per-command statistics: the program's base name.
pub fn command_signature(command: &[String]) -> String {
    command
        .first()
        .map(|program| {
            Path::new(program)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(program)
                .to_string()
        })
        .unwrap_or_default()
}

/// Captured contents of one output stream.
#[derive(Debug, Default)]
struct CapturedOutput {
    text: String,
    lines: u64,
}

/// Reads a stream to EOF, keeping at most `cap` bytes.
async fn capture_stream<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> CapturedOutput {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut total: usize = 0;
    let mut lines: u64 = 0;
    let mut last_byte = b'\n';

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Output stream read error: {}", e);
                break;
            }
        };

        let data = &chunk[..n];
        lines += data.iter().filter(|b| **b == b'\n').count() as u64;
        last_byte = data[n - 1];
        total += n;

        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&data[..room.min(n)]);
    }

    // Unterminated final line
    if total > 0 && last_byte != b'\n' {
        lines += 1;
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if total > kept.len() {
        text.push_str(&format!("\n...[truncated {} bytes]", total - kept.len()));
    }

    CapturedOutput { text, lines }
}

async fn collect_output(handle: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
    let Some(mut handle) = handle else {
        return CapturedOutput::default();
    };

    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            CapturedOutput::default()
        }
        Err(_) => {
            // A grandchild still holds the pipe open
            handle.abort();
            CapturedOutput::default()
        }
    }
}

/// Resolves once cancellation has been requested; never resolves without a receiver.
async fn cancellation(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel.as_mut() else {
        return std::future::pending().await;
    };

    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone, cancellation can no longer happen
            return std::future::pending().await;
        }
    }
}

/// `root` and every live descendant of it, parents first.
fn process_tree(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut tree = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        if !seen.insert(pid) || system.process(pid).is_none() {
            continue;
        }
        tree.push(pid);
        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied());
        }
    }
    tree
}

/// Sends `signal` to the process and all of its descendants through sysinfo.
///
/// The tree is collected before any signal goes out, so grandchildren are
/// reached even when the direct child dies first and they get reparented.
fn signal_tree(root: u32, signal: Signal) -> usize {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let tree = process_tree(&system, Pid::from_u32(root));
    let signalled = tree
        .iter()
        .filter(|pid| {
            system
                .process(**pid)
                .and_then(|process| process.kill_with(signal))
                .unwrap_or(false)
        })
        .count();

    if tree.len() > 1 {
        debug!("Sent {:?} to {} processes under pid {}", signal, signalled, root);
    }
    signalled
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Launches external invocations and tracks their outcomes.
pub struct ProcessExecutionTracker {
    sample_interval: Duration,
    output_cap: usize,
    kill_grace: Duration,
    stats: Mutex<HashMap<String, CommandStats>>,
}

impl ProcessExecutionTracker {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            sample_interval,
            output_cap: DEFAULT_OUTPUT_CAP,
            kill_grace: DEFAULT_KILL_GRACE,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Runs `command` to completion, timeout or cancellation.
    ///
    /// Only a spawn failure or an empty command is an `Err`; non-zero exits,
    /// timeouts and cancellation are reported in the record.
    pub async fn execute_command_async(
        &self,
        command: &[String],
        timeout: Duration,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ExecutionRecord> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BenchError::Configuration("empty command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the tool's children stay together and are
        // not hit by signals aimed at the benchmark runner itself
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| BenchError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        debug!("Spawned '{}' (pid {:?}, timeout {:.2?})", program, pid, timeout);

        let sampler = pid.map(|pid| {
            SamplerHandle::spawn(
                format!("pid-{}", pid),
                SampleTarget::Process(pid),
                self.sample_interval,
            )
        });

        let cap = self.output_cap;
        let stdout_reader = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(capture_stream(stream, cap)));
        let stderr_reader = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(capture_stream(stream, cap)));

        let deadline = tokio::time::Instant::from_std(started + timeout);
        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status?),
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
            _ = cancellation(&mut cancel) => WaitOutcome::Cancelled,
        };
        let duration = started.elapsed();

        let (status, timed_out, cancelled) = match outcome {
            WaitOutcome::Exited(status) => (Some(status), false, false),
            WaitOutcome::TimedOut => {
                warn!("'{}' exceeded its {:.2?} timeout, terminating", program, timeout);
                (self.terminate(&mut child, pid).await, true, false)
            }
            WaitOutcome::Cancelled => {
                warn!("'{}' cancelled, killing", program);
                (self.force_kill(&mut child, pid).await, false, true)
            }
        };

        let resources = sampler.map(SamplerHandle::stop).unwrap_or_default();
        let (stdout, stderr) = tokio::join!(collect_output(stdout_reader), collect_output(stderr_reader));
        let teardown = started.elapsed().saturating_sub(duration);

        let exit_code = status.and_then(|s| s.code());
        let success = !timed_out && !cancelled && status.map(|s| s.success()).unwrap_or(false);

        let mut stderr_text = stderr.text;
        if cancelled && stderr_text.is_empty() {
            stderr_text = "cancelled during execution".to_string();
        }

        let record = ExecutionRecord {
            command: command.to_vec(),
            exit_code,
            success,
            timed_out,
            cancelled,
            stdout: stdout.text,
            stderr: stderr_text,
            output_lines: stdout.lines + stderr.lines,
            duration,
            teardown,
            resources,
        };

        if !record.success && !record.timed_out && !record.cancelled {
            debug!(
                "'{}' failed with exit code {:?}: {}",
                program,
                record.exit_code,
                last_line(&record.stderr)
            );
        }

        self.update_stats(&record);
        Ok(record)
    }

    /// Blocking convenience wrapper that drives the invocation on a fresh runtime.
    pub fn execute_command(&self, command: &[String], timeout: Duration) -> Result<ExecutionRecord> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.execute_command_async(command, timeout, None))
    }

    /// SIGTERM to the whole tree, grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        let signalled = pid.map(|pid| signal_tree(pid, Signal::Term) > 0).unwrap_or(false);

        if signalled {
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => warn!("Failed to reap terminated process: {}", e),
                Err(_) => debug!("Process ignored SIGTERM for {:.2?}", self.kill_grace),
            }
        }

        self.force_kill(child, pid).await
    }

    /// SIGKILL to every descendant still alive, then to the child itself.
    async fn force_kill(&self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        if let Some(pid) = pid {
            signal_tree(pid, Signal::Kill);
        }
        if let Err(e) = child.kill().await {
            error!("Failed to kill process: {}", e);
            return None;
        }
        child.wait().await.ok()
    }

    fn update_stats(&self, record: &ExecutionRecord) {
        let signature = command_signature(&record.command);
        match self.stats.lock() {
            Ok(mut stats) => stats.entry(signature).or_default().record(record),
            Err(e) => error!("Command statistics lock poisoned: {}", e),
        }
    }

    /// Snapshot of the per-command statistics.
    pub fn command_stats(&self) -> HashMap<String, CommandStats> {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Default for ProcessExecutionTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
