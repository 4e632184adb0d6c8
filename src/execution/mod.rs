//! Task Execution Module
//!
//! Everything needed to run a single benchmark task.
//!
//! # Architecture
//!
//! - [`task`]: Task definitions, lifecycle states and command templates
//! - [`tracker`]: External process invocation with timeout and sampling
//! - [`collector`]: Queue-wait and execution-time measurement

pub mod collector;
pub mod task;
pub mod tracker;

pub use collector::{PerformanceCollector, PerformanceMetrics};
pub use task::{Objective, Task, TaskId, TaskStatus, TaskTemplate};
pub use tracker::{CommandStats, ExecutionRecord, ProcessExecutionTracker};
