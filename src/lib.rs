//! ParaBench - Parallel Benchmark Runner
//!
//! Benchmarks an external command-line tool by running many objective-driven
//! invocations concurrently, measuring their resource consumption, and
//! producing aggregated, alert-annotated reports.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`config`]: Benchmark configuration and suite files
//! - [`execution`]: Tasks, process invocation and per-task timing
//! - [`scheduler`]: Prioritized worker pool with pluggable placement
//! - [`metrics`]: Session aggregation and the detailed report
//! - [`monitoring`]: Resource sampling, timelines, live monitor and alerts
//! - [`orchestration`]: Suite driver tying the pieces together
//!
//! # Example
//!
//! ```rust,no_run
//! use parabench::config::BenchConfig;
//! use parabench::execution::{Objective, TaskTemplate};
//! use parabench::OrchestrationManager;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = BenchConfig::default();
//!     config.limits.max_concurrent_tasks = 4;
//!
//!     let mut manager = OrchestrationManager::new(config);
//!     manager.initialize()?;
//!
//!     let template = TaskTemplate::new(vec!["my-tool".into(), "{objective}".into()]);
//!     let objectives = vec![Objective::new("summarize"), Objective::new("translate")];
//!     let result = manager.run_benchmark_suite(&objectives, &template)?;
//!
//!     println!("{} completed, {} failed", result.completed, result.failed);
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod monitoring;
pub mod orchestration;
pub mod scheduler;

// Re-export commonly used types
pub use config::{load_config, load_suite, BenchConfig};
pub use error::{BenchError, Result};
pub use execution::{Objective, Task, TaskTemplate};
pub use orchestration::{OrchestrationManager, SuiteResult};
pub use scheduler::WorkerPool;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ParaBench";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ParaBench");
    }

    #[test]
    fn test_module_exports_task() {
        let task = Task::new(7, "probe", vec!["true".to_string()]);
        assert_eq!(task.id.to_string(), "task-7");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(BenchConfig::default().validate().is_ok());
    }
}
