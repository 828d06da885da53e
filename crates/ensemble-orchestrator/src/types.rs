use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use ensemble_core::EnsembleError;

/// Kind of work a task represents; each category has its own worker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Server-side code and APIs.
    Backend,
    /// User interface code.
    Frontend,
    /// Documentation.
    Docs,
    /// Build, deploy and infrastructure.
    Devops,
    /// Test suites.
    Testing,
    /// Schemas and migrations.
    Database,
    /// Design and cross-cutting structure.
    Architecture,
}

impl TaskCategory {
    /// Every category, in declaration order.
    pub const ALL: [TaskCategory; 7] = [
        TaskCategory::Backend,
        TaskCategory::Frontend,
        TaskCategory::Docs,
        TaskCategory::Devops,
        TaskCategory::Testing,
        TaskCategory::Database,
        TaskCategory::Architecture,
    ];

    /// Lowercase name used in config keys and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Backend => "backend",
            TaskCategory::Frontend => "frontend",
            TaskCategory::Docs => "docs",
            TaskCategory::Devops => "devops",
            TaskCategory::Testing => "testing",
            TaskCategory::Database => "database",
            TaskCategory::Architecture => "architecture",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EnsembleError::Config(format!("unknown task category '{s}'")))
    }
}

/// Scheduling priority. Declaration order is dispatch order: `High` sorts first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Dispatched first.
    High,
    /// The default.
    #[default]
    Medium,
    /// Dispatched last.
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "HIGH"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// An immutable unit of work produced by planning.
///
/// The only mutation the engine ever applies is adding synthetic dependency
/// edges (feature ordering, recovery rewiring) before a task is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a plan.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Free-form instructions for the worker.
    #[serde(default)]
    pub description: String,
    /// Selects the worker kind.
    pub category: TaskCategory,
    /// Dispatch order among ready tasks.
    #[serde(default)]
    pub priority: Priority,
    /// Cost reserved against the budget at dispatch.
    #[serde(default, alias = "estimatedCost")]
    pub estimated_cost: f64,
    /// Ids that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Files the task expects to touch.
    #[serde(default, alias = "files", alias = "fileTargets")]
    pub file_targets: Vec<String>,
    /// Opaque planner data carried through to the worker.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// A task with default priority, zero cost and no dependencies.
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: TaskCategory) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category,
            priority: Priority::default(),
            estimated_cost: 0.0,
            dependencies: Vec::new(),
            file_targets: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the estimated cost.
    pub fn with_cost(mut self, estimated_cost: f64) -> Self {
        self.estimated_cost = estimated_cost;
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the file targets.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_targets = files.into_iter().map(Into::into).collect();
        self
    }

    /// Add a dependency edge unless it is already present.
    pub fn add_dependency(&mut self, dep: impl Into<String>) {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    /// True when every dependency is in `completed`.
    pub fn is_ready<F>(&self, is_completed: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.dependencies.iter().all(|dep| is_completed(dep))
    }
}

/// Lifecycle of a task inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued with unmet dependencies.
    Pending,
    /// All dependencies met.
    Ready,
    /// Dispatched to a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Ended without completing.
    Failed,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// What a worker did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileActionKind {
    /// The file was created.
    Create,
    /// An existing file was changed.
    Modify,
}

/// A single file touched by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    /// Path relative to the project root.
    pub path: String,
    /// Create or modify.
    #[serde(rename = "action")]
    pub kind: FileActionKind,
}

impl FileAction {
    /// A created file.
    pub fn create(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileActionKind::Create,
        }
    }

    /// A modified file.
    pub fn modify(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileActionKind::Modify,
        }
    }
}

/// What a worker reports after successfully executing a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Actual incurred cost; may differ from the task's estimate.
    pub cost: f64,
    /// Files the worker created or modified.
    #[serde(default)]
    pub file_actions: Vec<FileAction>,
    /// Short worker report.
    #[serde(default)]
    pub summary: Option<String>,
}

impl TaskOutput {
    /// An output with the given cost and nothing else.
    pub fn new(cost: f64) -> Self {
        Self {
            cost,
            ..Self::default()
        }
    }

    /// Append a file action.
    pub fn with_action(mut self, action: FileAction) -> Self {
        self.file_actions.push(action);
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Why a task ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The task failed as many times as the breaker allows.
    CircuitBreakerOpen {
        /// Failures recorded when the breaker opened.
        attempts: u32,
        /// Message of the last failure.
        last_error: String,
    },
    /// The re-planner gave up on the task (or could not produce a usable plan).
    Escalated {
        /// Why the re-planner gave up.
        error: String,
    },
    /// The re-planner chose to drop the task.
    Skipped,
    /// A dependency ended without completing.
    DependencyFailed {
        /// The dependency that failed first.
        dependency: String,
    },
    /// The run stalled with this task unaffordable.
    BudgetExhausted,
    /// The run stalled with no worker obtainable for this task's category.
    NoWorkerCapacity,
}

impl FailureReason {
    /// Stable short code, e.g. `circuit_breaker_open`.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            FailureReason::Escalated { .. } => "escalated",
            FailureReason::Skipped => "skipped",
            FailureReason::DependencyFailed { .. } => "dependency_failed",
            FailureReason::BudgetExhausted => "budget_exhausted",
            FailureReason::NoWorkerCapacity => "no_worker_capacity",
        }
    }

    /// Whether the task ran and exhausted recovery, as opposed to never running.
    pub fn is_recovery_exhausted(&self) -> bool {
        matches!(
            self,
            FailureReason::CircuitBreakerOpen { .. } | FailureReason::Escalated { .. }
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::CircuitBreakerOpen {
                attempts,
                last_error,
            } => write!(f, "circuit_breaker_open after {attempts} attempts: {last_error}"),
            FailureReason::Escalated { error } => write!(f, "escalated: {error}"),
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency_failed: {dependency}")
            }
            other => f.write_str(other.code()),
        }
    }
}

/// Scheduler-owned wrapper around a [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// The task as planned.
    pub task: Task,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// When the task was last dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker output, once completed.
    pub result: Option<TaskOutput>,
    /// Why the task failed, once failed.
    pub failure: Option<FailureReason>,
    /// Set when the task was (re-)enqueued by failure recovery.
    #[serde(default)]
    pub recovery: bool,
}

impl TaskRecord {
    /// A pending record for `task`.
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            failure: None,
            recovery: false,
        }
    }

    /// Id of the wrapped task.
    pub fn id(&self) -> &str {
        &self.task.id
    }
}

/// A task that ended in the failed set, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    /// Id of the failed task.
    pub task_id: String,
    /// Why it failed.
    pub reason: FailureReason,
}

/// Final report of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Whether every task completed.
    pub success: bool,
    /// Tasks that completed.
    pub completed_task_count: usize,
    /// Tasks that ran and exhausted recovery.
    pub failed_task_count: usize,
    /// Tasks that never ran to completion because of a skip, a failed dependency or a stall.
    pub blocked_task_count: usize,
    /// Every task that ended without completing.
    pub failed_tasks: Vec<FailedTask>,
    /// Paths created across the run, deduplicated.
    pub files_created: Vec<String>,
    /// Paths modified across the run, deduplicated.
    pub files_modified: Vec<String>,
    /// Committed cost.
    pub total_cost: f64,
    /// Wall-clock time of the run.
    pub duration_ms: u64,
}

/// Metrics tracked per worker category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    /// Tasks sent to a worker.
    pub dispatched: u32,
    /// Tasks the category completed.
    pub completed: u32,
    /// Failed attempts.
    pub failed: u32,
    /// Committed cost.
    pub total_cost: f64,
    /// Time spent executing.
    pub duration_ms: u64,
}
