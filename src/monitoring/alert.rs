//! Threshold Alerts
//!
//! Alerts are informational: they are logged and forwarded to an optional
//! channel, and never stop a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric that an alert rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    /// Failed share of tasks finished within the recent window
    FailureRate,
    /// Busy workers divided by workers
    PoolUtilization,
    /// Tasks waiting for a worker
    QueueDepth,
    /// Host memory in MB
    MemoryUsage,
}

impl std::fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FailureRate => "failure rate",
            Self::PoolUtilization => "pool utilization",
            Self::QueueDepth => "queue depth",
            Self::MemoryUsage => "memory usage",
        };
        write!(f, "{}", name)
    }
}

/// A single threshold violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub message: String,
    pub metric: AlertMetric,
    /// Value that crossed the threshold
    pub observed: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(metric: AlertMetric, observed: f64, threshold: f64) -> Self {
        let message = match metric {
            AlertMetric::FailureRate | AlertMetric::PoolUtilization => format!(
                "{} {:.1}% exceeds {:.1}%",
                metric,
                observed * 100.0,
                threshold * 100.0
            ),
            AlertMetric::QueueDepth => format!("{} {} exceeds {}", metric, observed, threshold),
            AlertMetric::MemoryUsage => {
                format!("{} {:.0} MB exceeds {:.0} MB", metric, observed, threshold)
            }
        };

        Self {
            message,
            metric,
            observed,
            threshold,
            timestamp: Utc::now(),
        }
    }
}
