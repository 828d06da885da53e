use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// An observation published by the scheduler while driving a run.
///
/// Events are informational; nothing in the engine depends on them being
/// received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A task was handed to a worker.
    TaskAssigned {
        /// Task that was dispatched.
        task_id: String,
        /// Pool-assigned worker id.
        worker_id: String,
        /// Worker category.
        category: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A task could not be dispatched this scan and stays pending.
    TaskDeferred {
        /// Task left pending.
        task_id: String,
        /// Why admission failed.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// Task that finished.
        task_id: String,
        /// Actual cost committed for it.
        cost: f64,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A task reported failure (it may still be recovered).
    TaskFailed {
        /// Task that failed.
        task_id: String,
        /// Error the worker reported.
        reason: String,
        /// Failure count for this task, starting at 1.
        attempt: u32,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A task hit its attempt ceiling and will not run again.
    CircuitBreakerOpen {
        /// Task that was given up on.
        task_id: String,
        /// Failures recorded when the breaker opened.
        attempts: u32,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// Remaining budget dropped below the warning threshold.
    BudgetWarning {
        /// Task whose completion triggered the warning, if any.
        task_id: Option<String>,
        /// Budget left.
        remaining: f64,
        /// Configured ceiling.
        total: f64,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// The ledger invariant was violated by a commit.
    BudgetOverrun {
        /// Task whose commit broke the invariant.
        task_id: String,
        /// Committed spend after the commit.
        committed: f64,
        /// Configured ceiling.
        total: f64,
        /// When it happened.
        at: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::TaskAssigned { task_id, .. }
            | OrchestratorEvent::TaskDeferred { task_id, .. }
            | OrchestratorEvent::TaskCompleted { task_id, .. }
            | OrchestratorEvent::TaskFailed { task_id, .. }
            | OrchestratorEvent::CircuitBreakerOpen { task_id, .. }
            | OrchestratorEvent::BudgetOverrun { task_id, .. } => Some(task_id),
            OrchestratorEvent::BudgetWarning { task_id, .. } => task_id.as_deref(),
        }
    }

    /// When the event was raised.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestratorEvent::TaskAssigned { at, .. }
            | OrchestratorEvent::TaskDeferred { at, .. }
            | OrchestratorEvent::TaskCompleted { at, .. }
            | OrchestratorEvent::TaskFailed { at, .. }
            | OrchestratorEvent::CircuitBreakerOpen { at, .. }
            | OrchestratorEvent::BudgetWarning { at, .. }
            | OrchestratorEvent::BudgetOverrun { at, .. } => *at,
        }
    }

    /// Short machine-readable name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskAssigned { .. } => "task_assigned",
            OrchestratorEvent::TaskDeferred { .. } => "task_deferred",
            OrchestratorEvent::TaskCompleted { .. } => "task_completed",
            OrchestratorEvent::TaskFailed { .. } => "task_failed",
            OrchestratorEvent::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            OrchestratorEvent::BudgetWarning { .. } => "budget_warning",
            OrchestratorEvent::BudgetOverrun { .. } => "budget_overrun",
        }
    }
}

/// In-process event fan-out based on a tokio broadcast channel.
///
/// Slow subscribers lag and drop old events instead of back-pressuring the
/// scheduler.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Return the configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all active subscribers.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: OrchestratorEvent) {
        trace!(kind = event.kind(), task_id = ?event.task_id(), "event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
