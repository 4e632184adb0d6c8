//! Task Placement
//!
//! Decides which worker receives an admitted task. The algorithm set is
//! closed, so it is an enum dispatched through [`place`].

use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// Placement policy selected at pool construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// First idle worker takes the task
    #[default]
    Dynamic,
    /// Worker with the fewest assigned plus queued tasks
    LeastLoaded,
    /// Round-robin into local queues; idle workers steal from busy ones
    WorkStealing,
}

impl std::str::FromStr for SchedulingAlgorithm {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "least_loaded" => Ok(Self::LeastLoaded),
            "work_stealing" => Ok(Self::WorkStealing),
            other => Err(BenchError::Configuration(format!(
                "unknown scheduling algorithm '{}' (expected dynamic, least-loaded or work-stealing)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SchedulingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dynamic => "dynamic",
            Self::LeastLoaded => "least-loaded",
            Self::WorkStealing => "work-stealing",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    /// Has tasks in its local queue but is not running one
    Assigned,
    Executing,
    Retired,
}

/// What placement needs to know about a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerLoad {
    pub id: usize,
    pub state: WorkerState,
    /// Tasks waiting in the worker's local queue
    pub queued: usize,
}

impl WorkerLoad {
    fn is_active(&self) -> bool {
        self.state != WorkerState::Retired
    }

    /// Assigned plus queued tasks.
    fn load(&self) -> usize {
        let running = usize::from(self.state == WorkerState::Executing);
        running + self.queued
    }
}

/// Picks the worker that should receive the next admitted task.
///
/// Returns `None` when the algorithm cannot place the task right now.
/// `cursor` carries round-robin position between calls.
pub fn place(algorithm: SchedulingAlgorithm, workers: &[WorkerLoad], cursor: &mut usize) -> Option<usize> {
    match algorithm {
        SchedulingAlgorithm::Dynamic => workers
            .iter()
            .filter(|w| w.state == WorkerState::Idle && w.queued == 0)
            .map(|w| w.id)
            .min(),
        SchedulingAlgorithm::LeastLoaded => workers
            .iter()
            .filter(|w| w.is_active())
            .min_by_key(|w| (w.load(), w.id))
            .map(|w| w.id),
        SchedulingAlgorithm::WorkStealing => {
            let active: Vec<usize> = workers.iter().filter(|w| w.is_active()).map(|w| w.id).collect();
            if active.is_empty() {
                return None;
            }
            let chosen = active[*cursor % active.len()];
            *cursor = cursor.wrapping_add(1);
            Some(chosen)
        }
    }
}

/// Picks the worker an idle `thief` should steal from: the one with the
/// longest local queue, lowest id on ties.
pub fn steal_victim(workers: &[WorkerLoad], thief: usize) -> Option<usize> {
    workers
        .iter()
        .filter(|w| w.id != thief && w.queued > 0)
        .max_by(|a, b| a.queued.cmp(&b.queued).then_with(|| b.id.cmp(&a.id)))
        .map(|w| w.id)
}

/// `1 - stddev / mean` of per-worker completed counts, clamped to `[0, 1]`.
///
/// An empty pool, or one that has completed nothing, is perfectly balanced.
pub fn load_balance_score(completed: &[u64]) -> f64 {
    if completed.is_empty() {
        return 1.0;
    }

    let n = completed.len() as f64;
    let mean = completed.iter().sum::<u64>() as f64 / n;
    if mean == 0.0 {
        return 1.0;
    }

    let variance = completed
        .iter()
        .map(|&c| {
            let diff = c as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / n;

    (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(id: usize, state: WorkerState, queued: usize) -> WorkerLoad {
        WorkerLoad { id, state, queued }
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("dynamic".parse::<SchedulingAlgorithm>().unwrap(), SchedulingAlgorithm::Dynamic);
        assert_eq!(
            "least-loaded".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::LeastLoaded
        );
        assert_eq!(
            "WORK_STEALING".parse::<SchedulingAlgorithm>().unwrap(),
            SchedulingAlgorithm::WorkStealing
        );
        assert!("random".parse::<SchedulingAlgorithm>().is_err());
        assert_eq!(SchedulingAlgorithm::LeastLoaded.to_string(), "least-loaded");
    }

    #[test]
    fn test_dynamic_picks_first_idle() {
        let workers = [
            load(0, WorkerState::Executing, 0),
            load(1, WorkerState::Assigned, 1),
            load(2, WorkerState::Idle, 0),
            load(3, WorkerState::Idle, 0),
        ];
        let mut cursor = 0;
        assert_eq!(place(SchedulingAlgorithm::Dynamic, &workers, &mut cursor), Some(2));
    }

    #[test]
    fn test_dynamic_none_when_all_busy() {
        let workers = [load(0, WorkerState::Executing, 0), load(1, WorkerState::Retired, 0)];
        let mut cursor = 0;
        assert_eq!(place(SchedulingAlgorithm::Dynamic, &workers, &mut cursor), None);
    }

    #[test]
    fn test_least_loaded_tie_broken_by_id() {
        let workers = [
            load(0, WorkerState::Executing, 2),
            load(1, WorkerState::Executing, 0),
            load(2, WorkerState::Idle, 1),
            load(3, WorkerState::Retired, 0),
        ];
        let mut cursor = 0;
        // Workers 1 and 2 both carry one task
        assert_eq!(place(SchedulingAlgorithm::LeastLoaded, &workers, &mut cursor), Some(1));
    }

    #[test]
    fn test_work_stealing_round_robin_skips_retired() {
        let workers = [
            load(0, WorkerState::Idle, 0),
            load(1, WorkerState::Retired, 0),
            load(2, WorkerState::Idle, 0),
        ];
        let mut cursor = 0;
        let picks: Vec<_> = (0..4)
            .map(|_| place(SchedulingAlgorithm::WorkStealing, &workers, &mut cursor).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_steal_victim_is_busiest() {
        let workers = [
            load(0, WorkerState::Idle, 0),
            load(1, WorkerState::Executing, 2),
            load(2, WorkerState::Executing, 3),
            load(3, WorkerState::Executing, 3),
        ];
        assert_eq!(steal_victim(&workers, 0), Some(2));
        assert_eq!(steal_victim(&[load(0, WorkerState::Idle, 0)], 0), None);
    }

    #[test]
    fn test_load_balance_score() {
        assert_eq!(load_balance_score(&[]), 1.0);
        assert_eq!(load_balance_score(&[0, 0]), 1.0);
        assert_eq!(load_balance_score(&[5, 5, 5]), 1.0);

        // mean 2, stddev 2 -> 0
        assert_eq!(load_balance_score(&[4, 0]), 0.0);

        let score = load_balance_score(&[3, 2, 3, 2]);
        assert!(score > 0.7 && score < 1.0);

        // Very skewed loads clamp at 0
        assert_eq!(load_balance_score(&[100, 0, 0, 0]), 0.0);
    }
}
