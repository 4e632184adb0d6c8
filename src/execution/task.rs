//! Benchmark Tasks
//!
//! A task is one objective mapped to exactly one external-tool invocation
//! (plus retries). Command templates use placeholders that are resolved
//! per objective:
//!
//! - `{objective}` - the objective text
//! - `{strategy}` - the objective's strategy tag (empty when unset)
//! - `{task_id}` - the numeric task id

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Identifier of a task, unique within a pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for admission
    Pending,
    /// Picked up by a worker
    Running,
    /// Invocation exited with code 0
    Success,
    /// Retries exhausted, cancelled, or rejected
    Failure,
    /// Final attempt exceeded its timeout
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }

    /// Checks whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            // Cancellation before pickup
            (Self::Pending, Self::Failure) => true,
            (Self::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

/// One unit of benchmark work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Objective text handed to the external tool
    pub objective: String,
    /// Fully rendered argv
    pub command: Vec<String>,
    /// Higher values are served first
    pub priority: i32,
    /// Per-invocation timeout
    pub timeout: Duration,
    /// Additional attempts after the first on retryable failures
    pub max_retries: u32,
    /// Free-form strategy tag carried into reports
    pub strategy: Option<String>,
    /// When the task was created (start of queue wait)
    pub created_at: Instant,
}

impl Task {
    /// Creates a task with default priority, a 5 minute timeout and no retries.
    pub fn new(id: u64, objective: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: TaskId(id),
            objective: objective.into(),
            command,
            priority: 0,
            timeout: Duration::from_secs(300),
            max_retries: 0,
            strategy: None,
            created_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Rejects tasks the scheduler could never run.
    pub fn validate(&self) -> Result<()> {
        match self.command.first() {
            None => {
                return Err(BenchError::Configuration(format!(
                    "{} has an empty command",
                    self.id
                )))
            }
            Some(program) if program.trim().is_empty() => {
                return Err(BenchError::Configuration(format!(
                    "{} has an empty program name",
                    self.id
                )))
            }
            _ => {}
        }

        if self.timeout.is_zero() {
            return Err(BenchError::Configuration(format!(
                "{} has a zero timeout",
                self.id
            )));
        }

        Ok(())
    }
}

/// An objective from a suite, before it becomes a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ObjectiveRepr")]
pub struct Objective {
    pub text: String,
    pub priority: Option<i32>,
    pub strategy: Option<String>,
}

impl Objective {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: None,
            strategy: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

/// Accepts either a bare string or a detailed mapping in suite files.
#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectiveRepr {
    Text(String),
    Detailed {
        text: String,
        #[serde(default)]
        priority: Option<i32>,
        #[serde(default)]
        strategy: Option<String>,
    },
}

impl From<ObjectiveRepr> for Objective {
    fn from(repr: ObjectiveRepr) -> Self {
        match repr {
            ObjectiveRepr::Text(text) => Objective::new(text),
            ObjectiveRepr::Detailed {
                text,
                priority,
                strategy,
            } => Objective {
                text,
                priority,
                strategy,
            },
        }
    }
}

/// How objectives are turned into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// argv with placeholders
    pub command: Vec<String>,
    /// Falls back to the configured task timeout when unset
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub max_retries: u32,
    /// Priority for objectives that don't set one
    #[serde(default)]
    pub priority: i32,
}

impl TaskTemplate {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout_secs: None,
            max_retries: 0,
            priority: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Resolves placeholders for one objective.
    pub fn render(&self, id: u64, objective: &Objective) -> Vec<String> {
        let strategy = objective.strategy.as_deref().unwrap_or("");
        let task_id = id.to_string();

        self.command
            .iter()
            .map(|arg| {
                arg.replace("{objective}", &objective.text)
                    .replace("{strategy}", strategy)
                    .replace("{task_id}", &task_id)
            })
            .collect()
    }

    /// Builds the task for `objective`.
    pub fn to_task(&self, id: u64, objective: &Objective, default_timeout: Duration) -> Task {
        let timeout = self
            .timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default_timeout);

        let mut task = Task::new(id, objective.text.clone(), self.render(id, objective))
            .with_priority(objective.priority.unwrap_or(self.priority))
            .with_timeout(timeout)
            .with_max_retries(self.max_retries);
        task.strategy = objective.strategy.clone();
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new(7, "summarize", sh("true"))
            .with_priority(5)
            .with_timeout(Duration::from_secs(3))
            .with_max_retries(2)
            .with_strategy("greedy");

        assert_eq!(task.id, TaskId(7));
        assert_eq!(task.priority, 5);
        assert_eq!(task.timeout, Duration::from_secs(3));
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.strategy.as_deref(), Some("greedy"));
        assert_eq!(task.id.to_string(), "task-7");
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let task = Task::new(1, "x", Vec::new());
        assert!(matches!(task.validate(), Err(BenchError::Configuration(_))));

        let task = Task::new(1, "x", vec!["  ".to_string()]);
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let task = Task::new(1, "x", sh("true")).with_timeout(Duration::ZERO);
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Timeout));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failure));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_template_render() {
        let template = TaskTemplate::new(vec![
            "tool".to_string(),
            "--objective={objective}".to_string(),
            "--strategy".to_string(),
            "{strategy}".to_string(),
            "--id={task_id}".to_string(),
        ]);
        let objective = Objective::new("find bugs").with_strategy("bfs");

        let argv = template.render(3, &objective);
        assert_eq!(
            argv,
            vec!["tool", "--objective=find bugs", "--strategy", "bfs", "--id=3"]
        );
    }

    #[test]
    fn test_template_to_task_priority_and_timeout() {
        let template = TaskTemplate::new(sh("echo {objective}")).with_max_retries(1);
        let default_timeout = Duration::from_secs(9);

        let plain = template.to_task(1, &Objective::new("a"), default_timeout);
        assert_eq!(plain.priority, 0);
        assert_eq!(plain.timeout, default_timeout);
        assert_eq!(plain.max_retries, 1);

        let urgent = template
            .clone()
            .with_timeout_secs(0.5)
            .to_task(2, &Objective::new("b").with_priority(8), default_timeout);
        assert_eq!(urgent.priority, 8);
        assert_eq!(urgent.timeout, Duration::from_millis(500));
        assert_eq!(urgent.command[2], "echo b");
    }

    #[test]
    fn test_objective_yaml_forms() {
        let yaml = "- plain objective\n- text: detailed\n  priority: 3\n  strategy: dfs\n";
        let objectives: Vec<Objective> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(objectives.len(), 2);
        assert_eq!(objectives[0], Objective::new("plain objective"));
        assert_eq!(objectives[1].priority, Some(3));
        assert_eq!(objectives[1].strategy.as_deref(), Some("dfs"));
    }
}
