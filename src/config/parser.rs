//! Config and Suite Loading
//!
//! Reads the benchmark configuration and suite definitions from YAML.
//!
//! # Suite File Format
//!
//! ```yaml
//! command: ["my-tool", "--objective", "{objective}"]
//! timeout_secs: 60
//! max_retries: 1
//! objectives:
//!   - summarize the README
//!   - text: refactor the parser
//!     priority: 5
//!     strategy: incremental
//! adaptive:
//!   rounds: 3
//!   tasks_per_round: 6
//! ```

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{AdaptivePlan, BenchConfig};
use crate::error::{BenchError, Result};
use crate::execution::task::{Objective, TaskTemplate};

/// A benchmark suite: one command template and the objectives to run it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteFile {
    #[serde(flatten)]
    pub template: TaskTemplate,
    pub objectives: Vec<Objective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptivePlan>,
}

impl SuiteFile {
    /// Checks that the suite can produce runnable tasks.
    pub fn validate(&self) -> Result<()> {
        if self.template.command.is_empty() {
            return Err(BenchError::Configuration("suite command is empty".into()));
        }
        if self.objectives.is_empty() {
            return Err(BenchError::Configuration("suite has no objectives".into()));
        }
        if let Some(plan) = &self.adaptive {
            if plan.rounds == 0 || plan.tasks_per_round == 0 {
                return Err(BenchError::Configuration(
                    "adaptive rounds and tasks_per_round must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        BenchError::Configuration(format!(
            "failed to read {} file '{}': {}",
            what,
            path.display(),
            e
        ))
    })
}

/// Loads and validates a [`BenchConfig`] from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<BenchConfig> {
    let path = path.as_ref();
    info!("Loading config from: {}", path.display());

    let yaml_content = read_file(path, "config")?;
    debug!("Config content loaded ({} bytes)", yaml_content.len());

    // An empty file means "all defaults"
    let config: BenchConfig = if yaml_content.trim().is_empty() {
        BenchConfig::default()
    } else {
        serde_yaml::from_str(&yaml_content)?
    };

    config.validate()?;
    Ok(config)
}

/// Loads and validates a [`SuiteFile`] from a YAML file.
pub fn load_suite(path: impl AsRef<Path>) -> Result<SuiteFile> {
    let path = path.as_ref();
    info!("Loading suite from: {}", path.display());

    let yaml_content = read_file(path, "suite")?;
    let suite: SuiteFile = serde_yaml::from_str(&yaml_content)?;

    info!(
        "Parsed {} objectives for command '{}'",
        suite.objectives.len(),
        suite.template.command.first().map(String::as_str).unwrap_or("")
    );

    suite.validate()?;
    Ok(suite)
}

/// Writes a config back out as YAML.
pub fn save_config(config: &BenchConfig, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(config)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Config saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulingAlgorithm;
    use tempfile::tempdir;

    #[test]
    fn test_load_suite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suite.yaml");
        fs::write(
            &path,
            "command: [\"sh\", \"-c\", \"echo {objective}\"]\n\
             timeout_secs: 5\n\
             max_retries: 2\n\
             objectives:\n  - one\n  - text: two\n    priority: 4\n",
        )
        .unwrap();

        let suite = load_suite(&path).unwrap();
        assert_eq!(suite.objectives.len(), 2);
        assert_eq!(suite.template.max_retries, 2);
        assert_eq!(suite.template.timeout_secs, Some(5.0));
        assert_eq!(suite.objectives[1].priority, Some(4));
        assert!(suite.adaptive.is_none());
    }

    #[test]
    fn test_load_suite_without_objectives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suite.yaml");
        fs::write(&path, "command: [\"true\"]\nobjectives: []\n").unwrap();

        assert!(matches!(load_suite(&path), Err(BenchError::Configuration(_))));
    }

    #[test]
    fn test_load_suite_missing_file() {
        let result = load_suite("/nonexistent/suite.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = BenchConfig::default();
        config.scheduling_algorithm = SchedulingAlgorithm::WorkStealing;
        config.limits.max_concurrent_tasks = 3;
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_config_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "").unwrap();

        assert_eq!(load_config(&path).unwrap(), BenchConfig::default());
    }

    #[test]
    fn test_load_config_invalid_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "limits:\n  max_concurrent_tasks: 0\n").unwrap();

        assert!(matches!(load_config(&path), Err(BenchError::Configuration(_))));
    }
}
