//! Worker Auto-Scaling
//!
//! Watches the queue-wait trend and recommends at most one worker more or
//! less per evaluation, within a floor and ceiling.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;

/// Queue waits kept for trend evaluation.
const WAIT_WINDOW: usize = 32;

/// Recommendation from one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Hold,
}

/// Tracks recent queue waits and decides scaling steps.
#[derive(Debug, Clone)]
pub struct AutoScaler {
    floor: usize,
    ceiling: usize,
    /// Mean wait above which the pool grows
    scale_up_wait: Duration,
    /// Mean wait below which the pool shrinks
    scale_down_wait: Duration,
    waits: VecDeque<Duration>,
    previous_mean: Option<Duration>,
}

impl AutoScaler {
    pub fn new(floor: usize, ceiling: usize) -> Self {
        Self {
            floor: floor.max(1),
            ceiling: ceiling.max(floor.max(1)),
            scale_up_wait: Duration::from_millis(500),
            scale_down_wait: Duration::from_millis(50),
            waits: VecDeque::with_capacity(WAIT_WINDOW),
            previous_mean: None,
        }
    }

    pub fn with_thresholds(mut self, scale_up_wait: Duration, scale_down_wait: Duration) -> Self {
        self.scale_up_wait = scale_up_wait;
        self.scale_down_wait = scale_down_wait;
        self
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Records the queue wait of a task that was just picked up.
    pub fn record_wait(&mut self, wait: Duration) {
        if self.waits.len() == WAIT_WINDOW {
            self.waits.pop_front();
        }
        self.waits.push_back(wait);
    }

    /// Mean of the recorded waits.
    pub fn mean_wait(&self) -> Option<Duration> {
        if self.waits.is_empty() {
            return None;
        }
        let total: Duration = self.waits.iter().sum();
        Some(total / self.waits.len() as u32)
    }

    /// Decides one step given the current worker count and queue depth.
    ///
    /// Grows when tasks are waiting and the mean wait is high and not
    /// falling; shrinks when nothing is queued and waits are short.
    pub fn evaluate(&mut self, workers: usize, queue_length: usize) -> ScaleDecision {
        let mean = self.mean_wait().unwrap_or(Duration::ZERO);
        let rising = self.previous_mean.map(|prev| mean >= prev).unwrap_or(true);
        self.previous_mean = Some(mean);

        let decision = if workers < self.floor {
            ScaleDecision::Up
        } else if workers > self.ceiling {
            ScaleDecision::Down
        } else if queue_length > 0 && mean > self.scale_up_wait && rising && workers < self.ceiling {
            ScaleDecision::Up
        } else if queue_length == 0 && mean < self.scale_down_wait && workers > self.floor {
            ScaleDecision::Down
        } else {
            ScaleDecision::Hold
        };

        debug!(
            "Auto-scale: workers={}, queued={}, mean wait={:.2?}, rising={} -> {:?}",
            workers, queue_length, mean, rising, decision
        );
        decision
    }
}
