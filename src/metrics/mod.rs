//! Metrics Module
//!
//! Session-level aggregation of task results into the detailed report.

pub mod aggregator;
pub mod report;

pub use aggregator::MetricsAggregator;
pub use report::{AggregatedReport, TaskReport};
