//! Resource Usage Sampling
//!
//! Measures CPU, memory, disk and network usage for a single process or
//! the whole host. Statistics are folded into running min/max/sum values so
//! long runs keep constant memory; only the last few raw samples are kept
//! for diagnostics.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sysinfo::{Networks, Pid, ProcessRefreshKind, System};

use crate::error::{BenchError, Result};

/// Default interval between background samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Raw samples retained per sampler unless configured otherwise.
pub const DEFAULT_SAMPLE_HISTORY: usize = 32;

const BYTES_PER_MB: u64 = 1024 * 1024;

static LOGICAL_CORES: Lazy<usize> = Lazy::new(num_cpus::get);

/// Number of logical cores, which bounds valid per-process CPU percent.
pub fn logical_cores() -> usize {
    *LOGICAL_CORES
}

static HOST_MEMORY_MB: Lazy<u64> = Lazy::new(|| {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory() / BYTES_PER_MB
});

/// Total physical memory of the host in megabytes, 0 if unreadable.
pub fn host_memory_mb() -> u64 {
    *HOST_MEMORY_MB
}

/// What a sampler measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleTarget {
    /// A single process by pid
    Process(u32),
    /// The whole machine
    Host,
}

/// A resource snapshot.
///
/// Network counters are only available for [`SampleTarget::Host`] and disk
/// counters only for [`SampleTarget::Process`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// CPU usage percentage (may exceed 100 on multi-core)
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_sent_bytes: u64,
    pub net_received_bytes: u64,
    /// True when the target could not be read and this is the last known value
    pub stale: bool,
}

impl ResourceUsage {
    /// Creates a snapshot, rejecting CPU values outside `0..=100 * cores`.
    pub fn new(cpu_percent: f64, memory_bytes: u64) -> Result<Self> {
        let ceiling = 100.0 * logical_cores() as f64;
        if !cpu_percent.is_finite() || cpu_percent < 0.0 || cpu_percent > ceiling {
            return Err(BenchError::Configuration(format!(
                "cpu percent {} outside 0..={}",
                cpu_percent, ceiling
            )));
        }

        Ok(Self {
            cpu_percent,
            memory_bytes,
            ..Self::default()
        })
    }

    pub fn with_disk(mut self, read_bytes: u64, write_bytes: u64) -> Self {
        self.disk_read_bytes = read_bytes;
        self.disk_write_bytes = write_bytes;
        self
    }

    pub fn with_network(mut self, sent_bytes: u64, received_bytes: u64) -> Self {
        self.net_sent_bytes = sent_bytes;
        self.net_received_bytes = received_bytes;
        self
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / BYTES_PER_MB as f64
    }
}

/// A single timestamped sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    pub usage: ResourceUsage,
}

/// Running min/max/sum for one metric.
#[derive(Debug, Clone, Copy, Default)]
struct RunningStats {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Peak/average rollup over a sampler's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRollup {
    /// Samples folded into the memory statistics
    pub sample_count: u64,
    /// Samples folded into the CPU statistics (excludes warmup)
    pub cpu_sample_count: u64,
    /// Reads that returned the last known value
    pub stale_samples: u64,
    pub peak_cpu_percent: f64,
    pub average_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub min_memory_bytes: u64,
    pub average_memory_bytes: f64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_sent_bytes: u64,
    pub net_received_bytes: u64,
}

impl ResourceRollup {
    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_bytes as f64 / BYTES_PER_MB as f64
    }
}

/// Samples resource usage for one target.
///
/// # Example
///
/// ```rust,ignore
/// use parabench::monitoring::{ResourceSampler, SampleTarget};
/// use std::time::Duration;
/// use std::thread;
///
/// let mut sampler = ResourceSampler::new(SampleTarget::Host);
///
/// for _ in 0..5 {
///     sampler.sample();
///     thread::sleep(Duration::from_millis(250));
/// }
///
/// println!("{}", sampler.get_summary());
/// ```
pub struct ResourceSampler {
    system: System,
    networks: Option<Networks>,
    target: SampleTarget,
    warmup_done: bool,
    last: Option<ResourceUsage>,
    cpu: RunningStats,
    memory: RunningStats,
    stale_samples: u64,
    disk_read_bytes: u64,
    disk_write_bytes: u64,
    net_baseline: Option<(u64, u64)>,
    net_sent_bytes: u64,
    net_received_bytes: u64,
    recent: VecDeque<ResourceSample>,
    history_capacity: usize,
}

impl ResourceSampler {
    /// Creates a sampler for `target`.
    pub fn new(target: SampleTarget) -> Self {
        let networks = match target {
            SampleTarget::Host => Some(Networks::new_with_refreshed_list()),
            SampleTarget::Process(_) => None,
        };

        Self {
            system: System::new(),
            networks,
            target,
            warmup_done: false,
            last: None,
            cpu: RunningStats::default(),
            memory: RunningStats::default(),
            stale_samples: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            net_baseline: None,
            net_sent_bytes: 0,
            net_received_bytes: 0,
            recent: VecDeque::with_capacity(DEFAULT_SAMPLE_HISTORY),
            history_capacity: DEFAULT_SAMPLE_HISTORY,
        }
    }

    /// Sampler for the current process.
    pub fn current_process() -> Self {
        Self::new(SampleTarget::Process(std::process::id()))
    }

    /// Sets how many raw samples are retained.
    pub fn with_history(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self.recent = VecDeque::with_capacity(capacity);
        self
    }

    pub fn target(&self) -> SampleTarget {
        self.target
    }

    /// Takes a sample.
    ///
    /// The first call warms up CPU accounting, so its CPU reading is not
    /// folded into the statistics. If the target cannot be read the last
    /// known snapshot is returned marked stale.
    pub fn sample(&mut self) -> ResourceUsage {
        let reading = match self.target {
            SampleTarget::Process(pid) => self.read_process(Pid::from_u32(pid)),
            SampleTarget::Host => Some(self.read_host()),
        };

        let Some(usage) = reading else {
            self.stale_samples += 1;
            let mut stale = self.last.unwrap_or_default();
            stale.stale = true;
            return stale;
        };

        if self.warmup_done {
            self.cpu.push(usage.cpu_percent);
        } else {
            self.warmup_done = true;
        }
        self.memory.push(usage.memory_bytes as f64);

        if self.history_capacity > 0 {
            if self.recent.len() == self.history_capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(ResourceSample {
                timestamp: Instant::now(),
                usage,
            });
        }

        self.last = Some(usage);
        usage
    }

    fn read_process(&mut self, pid: Pid) -> Option<ResourceUsage> {
        let refresh_kind = ProcessRefreshKind::new()
            .with_cpu()
            .with_memory()
            .with_disk_usage();

        if !self.system.refresh_process_specifics(pid, refresh_kind) {
            debug!("Process {} is no longer readable", pid);
            return None;
        }

        let process = self.system.process(pid)?;
        let disk = process.disk_usage();
        self.disk_read_bytes = self.disk_read_bytes.max(disk.total_read_bytes);
        self.disk_write_bytes = self.disk_write_bytes.max(disk.total_written_bytes);

        let usage = clamped_usage(process.cpu_usage() as f64, process.memory())
            .with_disk(disk.total_read_bytes, disk.total_written_bytes);
        Some(usage)
    }

    fn read_host(&mut self) -> ResourceUsage {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_info().cpu_usage() as f64;
        let memory = self.system.used_memory();

        let (sent, received) = match self.networks.as_mut() {
            Some(networks) => {
                networks.refresh();
                let mut sent = 0u64;
                let mut received = 0u64;
                for (_name, data) in &*networks {
                    sent += data.total_transmitted();
                    received += data.total_received();
                }
                (sent, received)
            }
            None => (0, 0),
        };

        // Counters are cumulative since boot; report them relative to the first read
        let (base_sent, base_received) = *self.net_baseline.get_or_insert((sent, received));
        self.net_sent_bytes = sent.saturating_sub(base_sent);
        self.net_received_bytes = received.saturating_sub(base_received);

        clamped_usage(cpu, memory).with_network(self.net_sent_bytes, self.net_received_bytes)
    }

    /// Returns the rollup of everything sampled so far.
    pub fn rollup(&self) -> ResourceRollup {
        ResourceRollup {
            sample_count: self.memory.count,
            cpu_sample_count: self.cpu.count,
            stale_samples: self.stale_samples,
            peak_cpu_percent: self.cpu.max,
            average_cpu_percent: self.cpu.mean(),
            peak_memory_bytes: self.memory.max as u64,
            min_memory_bytes: self.memory.min as u64,
            average_memory_bytes: self.memory.mean(),
            disk_read_bytes: self.disk_read_bytes,
            disk_write_bytes: self.disk_write_bytes,
            net_sent_bytes: self.net_sent_bytes,
            net_received_bytes: self.net_received_bytes,
        }
    }

    /// Most recent snapshot, if any read has succeeded.
    pub fn last_usage(&self) -> Option<ResourceUsage> {
        self.last
    }

    /// Returns the retained raw samples, oldest first.
    pub fn recent_samples(&self) -> Vec<ResourceSample> {
        self.recent.iter().cloned().collect()
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.memory.count == 0 {
            return "No resource data collected".to_string();
        }

        let rollup = self.rollup();
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak CPU: {:.1}%\n  Peak Memory: {:.1} MB\n  Min Memory: {:.1} MB\n  Samples: {}",
            rollup.average_cpu_percent,
            rollup.peak_cpu_percent,
            rollup.peak_memory_mb(),
            rollup.min_memory_bytes as f64 / BYTES_PER_MB as f64,
            rollup.sample_count
        )
    }
}

/// Builds a snapshot from raw sysinfo readings, clamping CPU jitter into range.
fn clamped_usage(cpu_percent: f64, memory_bytes: u64) -> ResourceUsage {
    let ceiling = 100.0 * logical_cores() as f64;
    let cpu = if cpu_percent.is_finite() {
        cpu_percent.clamp(0.0, ceiling)
    } else {
        0.0
    };

    ResourceUsage::new(cpu, memory_bytes).unwrap_or_default()
}

/// A sampler running on a background thread until stopped.
pub struct SamplerHandle {
    label: String,
    sampler: Arc<Mutex<ResourceSampler>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Starts sampling `target` every `interval`.
    pub fn spawn(label: impl Into<String>, target: SampleTarget, interval: Duration) -> Self {
        Self::spawn_sampler(label, ResourceSampler::new(target), interval)
    }

    /// Starts sampling with a preconfigured sampler.
    pub fn spawn_sampler(
        label: impl Into<String>,
        sampler: ResourceSampler,
        interval: Duration,
    ) -> Self {
        let label = label.into();
        let sampler = Arc::new(Mutex::new(sampler));
        let (stop_tx, stop_rx) = channel::<()>();

        let shared = Arc::clone(&sampler);
        let thread_label = label.clone();
        let thread = thread::Builder::new()
            .name(format!("sampler-{}", label))
            .spawn(move || loop {
                if let Ok(mut sampler) = shared.lock() {
                    sampler.sample();
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => {
                        debug!("Sampler '{}' stopped", thread_label);
                        break;
                    }
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start sampler thread '{}': {}", label, e);
                None
            }
        };

        Self {
            label,
            sampler,
            stop_tx: Some(stop_tx),
            thread,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Latest snapshot copy.
    pub fn current(&self) -> Option<ResourceUsage> {
        self.sampler.lock().ok().and_then(|s| s.last_usage())
    }

    /// Rollup so far, without stopping.
    pub fn rollup(&self) -> ResourceRollup {
        self.sampler
            .lock()
            .map(|s| s.rollup())
            .unwrap_or_default()
    }

    /// Stops the background thread and returns the final rollup.
    pub fn stop(mut self) -> ResourceRollup {
        self.shutdown();
        self.rollup()
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the thread immediately
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Sampler thread '{}' panicked", self.label);
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
