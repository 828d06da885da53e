//! Core types and error definitions for the ensemble orchestration engine.
//!
//! This crate provides the foundational types shared across all ensemble crates:
//! the error taxonomy used by planning, dispatch, execution and recovery, and the
//! in-process event bus the scheduler publishes its observations on.
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for every orchestration subsystem.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`EventBus`] — Broadcast fan-out of [`OrchestratorEvent`]s to live subscribers.

/// Orchestrator events and the broadcast event bus.
pub mod event;

pub use event::{EventBus, OrchestratorEvent};

// --- Error types ---

/// Top-level error type for the ensemble engine.
///
/// Variants map onto the failure classes the scheduler reacts to differently:
/// planning errors abort a run, dispatch errors defer a task, execution errors
/// go to recovery, and a budget overrun is a defect alarm.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// The task graph is malformed: duplicate ids, unknown dependencies or a cycle.
    #[error("Planning error: {0}")]
    Planning(String),

    /// No worker of the category could be obtained within the wait threshold.
    #[error("Worker pool exhausted for category '{category}' after {waited_ms}ms")]
    PoolExhausted {
        /// Category whose pool was at capacity.
        category: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// A budget reservation was rejected by admission control.
    #[error("Budget exceeded for '{operation_id}': requested {requested:.4}, available {available:.4}")]
    BudgetExceeded {
        /// Operation the reservation was requested for.
        operation_id: String,
        /// Estimated cost that was requested.
        requested: f64,
        /// Budget left after committed spend and outstanding reservations.
        available: f64,
    },

    /// A dispatched task reported failure.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The circuit breaker for a task is open.
    #[error("Recovery exhausted for task '{task_id}' after {attempts} attempts")]
    RecoveryExhausted {
        /// Task whose breaker opened.
        task_id: String,
        /// Attempts recorded when the breaker opened.
        attempts: u32,
    },

    /// The budget ledger invariant was violated.
    #[error("Budget overrun: committed {committed:.4} + reserved {reserved:.4} > total {total:.4}")]
    BudgetOverrun {
        /// Committed spend.
        committed: f64,
        /// Sum of outstanding reservations.
        reserved: f64,
        /// Configured ceiling.
        total: f64,
    },

    /// Worker construction or registry lookup failed.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A snapshot could not be captured or restored.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Whether this error means "try again on a later scan" rather than "failed".
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            EnsembleError::PoolExhausted { .. } | EnsembleError::BudgetExceeded { .. }
        )
    }
}

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;
