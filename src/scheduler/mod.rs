//! Scheduling Module
//!
//! Runs benchmark tasks on a bounded, prioritized worker pool.
//!
//! # Architecture
//!
//! - [`queue`]: Max-priority queue with FIFO tie-breaking
//! - [`placement`]: Worker selection per scheduling algorithm
//! - [`autoscale`]: Queue-wait driven scaling decisions
//! - [`pool`]: Worker threads, admission, retries and shutdown

pub mod autoscale;
pub mod placement;
pub mod pool;
pub mod queue;

pub use autoscale::{AutoScaler, ScaleDecision};
pub use placement::{SchedulingAlgorithm, WorkerState};
pub use pool::{PoolMetrics, SchedulingMetrics, ShutdownReport, TaskHandle, TaskOutcome, WorkerPool};
pub use queue::PriorityQueue;
