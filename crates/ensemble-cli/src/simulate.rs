//! Simulated workers for dry runs.
//!
//! A simulated worker "performs" a task by sleeping for a configured delay and
//! reporting the task's estimated cost (scaled by a fixed variance) plus one
//! create action per file target.

use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_orchestrator::{FileAction, Task, TaskOutput, Worker, WorkerRegistry};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// `[simulation]` table of `ensemble.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Time each simulated task takes.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Actual cost = estimate * (1 + cost_variance).
    #[serde(default)]
    pub cost_variance: f64,
    /// Task ids that always fail, to exercise recovery.
    #[serde(default)]
    pub fail_tasks: Vec<String>,
}

fn default_delay_ms() -> u64 {
    50
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            cost_variance: 0.0,
            fail_tasks: Vec::new(),
        }
    }
}

/// Sleeps, then reports the estimated cost scaled by the configured variance.
pub struct SimulatedWorker {
    delay: Duration,
    cost_factor: f64,
    fail_tasks: Arc<HashSet<String>>,
}

#[async_trait]
impl Worker for SimulatedWorker {
    async fn execute(&self, task: &Task) -> EnsembleResult<TaskOutput> {
        tokio::time::sleep(self.delay).await;
        if self.fail_tasks.contains(&task.id) {
            return Err(EnsembleError::Execution(format!(
                "simulated failure for '{}'",
                task.id
            )));
        }
        let mut output = TaskOutput::new((task.estimated_cost * self.cost_factor).max(0.0))
            .with_summary(format!("simulated {} task '{}'", task.category, task.name));
        for file in &task.file_targets {
            output = output.with_action(FileAction::create(file.clone()));
        }
        Ok(output)
    }
}

/// A registry that builds a [`SimulatedWorker`] for every category.
pub fn simulated_registry(config: &SimulationConfig) -> WorkerRegistry {
    let delay = Duration::from_millis(config.delay_ms);
    let cost_factor = 1.0 + config.cost_variance;
    let fail_tasks: Arc<HashSet<String>> = Arc::new(config.fail_tasks.iter().cloned().collect());

    let mut registry = WorkerRegistry::new();
    registry.register_all(move |_| {
        Ok(Box::new(SimulatedWorker {
            delay,
            cost_factor,
            fail_tasks: Arc::clone(&fail_tasks),
        }) as Box<dyn Worker>)
    });
    registry
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_orchestrator::{FileActionKind, TaskCategory};

    #[tokio::test]
    async fn test_simulated_worker_reports_cost_and_files() {
        let registry = simulated_registry(&SimulationConfig {
            delay_ms: 0,
            cost_variance: 0.5,
            fail_tasks: vec![],
        });
        let worker = registry.create(TaskCategory::Docs).unwrap();
        let task = Task::new("readme", "Readme", TaskCategory::Docs)
            .with_cost(0.2)
            .with_files(["README.md"]);

        let output = worker.execute(&task).await.unwrap();
        assert!((output.cost - 0.3).abs() < 1e-9);
        assert_eq!(output.file_actions.len(), 1);
        assert_eq!(output.file_actions[0].kind, FileActionKind::Create);
    }

    #[tokio::test]
    async fn test_configured_failures() {
        let registry = simulated_registry(&SimulationConfig {
            delay_ms: 0,
            fail_tasks: vec!["broken".into()],
            ..SimulationConfig::default()
        });
        let worker = registry.create(TaskCategory::Backend).unwrap();
        let task = Task::new("broken", "Broken", TaskCategory::Backend);
        assert!(worker.execute(&task).await.is_err());
    }
}
