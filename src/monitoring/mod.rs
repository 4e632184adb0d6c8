//! Monitoring Module
//!
//! Resource sampling, execution timelines and the live performance monitor.
//!
//! # Components
//!
//! - [`ResourceSampler`] / [`SamplerHandle`]: CPU, memory, disk and network sampling
//! - [`ExecutionTimeline`]: Task start/end events for Gantt charts
//! - [`PerformanceMonitor`]: Periodic snapshots with threshold alerts
//! - [`Alert`]: A single threshold violation

pub mod alert;
pub mod monitor;
pub mod resource;
pub mod timeline;

pub use alert::{Alert, AlertMetric};
pub use monitor::{LiveMetrics, MetricsProbe, MonitorConfig, MonitorReport, MonitorSummary, PerformanceMonitor};
pub use resource::{ResourceRollup, ResourceSample, ResourceSampler, ResourceUsage, SampleTarget, SamplerHandle};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
