//! Task orchestration engine: dependency-ordered, budget-gated dispatch of
//! tasks to reusable, category-typed workers with bounded failure recovery.
//!
//! A run builds a [`DependencyGraph`] from a [`Plan`], queues its tasks in
//! execution order, then the [`Orchestrator`] loop dispatches ready tasks to
//! workers from the [`WorkerPool`] under a concurrency ceiling, with every
//! dispatch admitted by the [`BudgetController`]. Failures go through the
//! [`RecoveryCoordinator`]'s per-task circuit breaker and an optional
//! [`Replanner`].
//!
//! # Main types
//!
//! - [`Orchestrator`] — The scheduler loop; produces an [`ExecutionSummary`].
//! - [`DependencyGraph`] — Validated, topologically ordered task graph.
//! - [`WorkerPool`] — Bounded per-category pools of reusable [`Worker`]s.
//! - [`BudgetController`] — Reserve/commit/release admission control.
//! - [`RecoveryCoordinator`] — Circuit breaker and re-planner dispatch.
//! - [`SchedulerSnapshot`] — Serializable state for resuming a run.

/// Reserve/commit/release budget admission control.
pub mod budget;
/// Engine configuration loaded from TOML.
pub mod config;
/// The scheduler loop.
pub mod engine;
/// Plans, sub-plan merging and the dependency graph builder.
pub mod graph;
/// Per-category worker metrics.
pub mod monitor;
/// Worker trait, registry and pool.
pub mod pool;
/// Circuit breaker and re-planner contract.
pub mod recovery;
/// Snapshot/restore of scheduler state.
pub mod snapshot;
/// Pending queue and task records.
pub mod task_queue;
/// Shared types (Task, TaskRecord, ExecutionSummary, etc.).
pub mod types;

pub use budget::{BudgetController, BudgetLedger, CommitOutcome};
pub use config::{BudgetConfig, OrchestratorConfig, PoolConfig, RecoveryConfig};
pub use engine::{CheckpointHook, Orchestrator};
pub use graph::{order_extension, DependencyGraph, FeatureConstraint, FeaturePlan, Plan};
pub use monitor::{CategoryState, WorkerMonitor};
pub use pool::{
    PoolStats, Worker, WorkerConstructor, WorkerLease, WorkerPool, WorkerRegistry, WorkerState,
};
pub use recovery::{
    replan_fn, BreakerDecision, BreakerState, FailureContext, RecoveryCoordinator, RecoveryPlan,
    RecoveryStrategy, RecoveryVerdict, ReplanFn, Replanner,
};
pub use snapshot::{SchedulerSnapshot, SNAPSHOT_VERSION};
pub use task_queue::TaskQueue;
pub use types::{
    CategoryMetrics, ExecutionSummary, FailedTask, FailureReason, FileAction, FileActionKind,
    Priority, Task, TaskCategory, TaskOutput, TaskRecord, TaskStatus,
};

pub use ensemble_core::{EnsembleError, EnsembleResult, EventBus, OrchestratorEvent};
