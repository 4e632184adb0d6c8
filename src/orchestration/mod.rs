//! Orchestration Module
//!
//! Suite-level driver tying the worker pool to metrics aggregation.

pub mod manager;

pub use manager::{OrchestrationManager, RoundSummary, SuiteResult, TaskFailure};
