//! Configuration Module
//!
//! Configuration surface consumed by the benchmark core and the YAML
//! loaders for configs and suites.
//!
//! - [`model`]: `BenchConfig` and its sections
//! - [`parser`]: YAML loading and saving

pub mod model;
pub mod parser;

pub use model::{
    AdaptivePlan, AlertThresholds, BenchConfig, ExecutionMode, MonitorSettings, ResourceLimits,
    WorkerSettings,
};
pub use parser::{load_config, load_suite, save_config, SuiteFile};
