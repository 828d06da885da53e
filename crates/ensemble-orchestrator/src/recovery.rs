use crate::budget::BudgetLedger;
use crate::types::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ensemble_core::EnsembleResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the re-planner wants done with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Run the same task again.
    Retry,
    /// Run it again, possibly on different terms.
    Reassign,
    /// Split it into smaller tasks.
    Breakdown,
    /// Drop it; dependents are blocked.
    Skip,
    /// Give up on it.
    Escalate,
}

/// Re-planner verdict. `modified_tasks` replaces the failed task when non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Chosen strategy.
    pub strategy: RecoveryStrategy,
    /// Tasks to run instead of the failed one.
    #[serde(default, alias = "modifiedTasks")]
    pub modified_tasks: Vec<Task>,
}

impl RecoveryPlan {
    /// Retry the task unchanged.
    pub fn retry() -> Self {
        Self::of(RecoveryStrategy::Retry)
    }

    /// Drop the task.
    pub fn skip() -> Self {
        Self::of(RecoveryStrategy::Skip)
    }

    /// Give up on the task.
    pub fn escalate() -> Self {
        Self::of(RecoveryStrategy::Escalate)
    }

    /// Replace the task with `tasks`.
    pub fn breakdown(tasks: Vec<Task>) -> Self {
        Self {
            strategy: RecoveryStrategy::Breakdown,
            modified_tasks: tasks,
        }
    }

    /// A plan with `strategy` and no replacement tasks.
    pub fn of(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            modified_tasks: Vec::new(),
        }
    }

    /// Attach replacement tasks.
    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.modified_tasks = tasks;
        self
    }
}

/// Everything the re-planner is told about a failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    /// The task that failed.
    pub task: Task,
    /// Error it failed with.
    pub error: String,
    /// 1-based attempt number of this failure.
    pub attempt: u32,
    /// Ids still waiting to run.
    pub remaining_queue: Vec<String>,
    /// Ids already completed, in completion order.
    pub completed: Vec<String>,
    /// Ledger at the time of the failure.
    pub budget: BudgetLedger,
}

/// External collaborator that decides how to recover from a task failure.
#[async_trait]
pub trait Replanner: Send + Sync {
    /// Decide how to recover from the failure described by `context`.
    async fn replan(&self, context: &FailureContext) -> EnsembleResult<RecoveryPlan>;
}

/// A [`Replanner`] backed by a synchronous closure. See [`replan_fn`].
#[derive(Clone)]
pub struct ReplanFn<F> {
    f: F,
}

/// Wrap a closure as a [`Replanner`].
pub fn replan_fn<F>(f: F) -> ReplanFn<F>
where
    F: Fn(&FailureContext) -> EnsembleResult<RecoveryPlan> + Send + Sync,
{
    ReplanFn { f }
}

#[async_trait]
impl<F> Replanner for ReplanFn<F>
where
    F: Fn(&FailureContext) -> EnsembleResult<RecoveryPlan> + Send + Sync,
{
    async fn replan(&self, context: &FailureContext) -> EnsembleResult<RecoveryPlan> {
        (self.f)(context)
    }
}

/// Per-task breaker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    /// Failures recorded inside the current window.
    pub attempts: u32,
    /// Time of the most recent failure.
    pub last_attempt_at: DateTime<Utc>,
}

/// Result of counting a failure against a task's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Below the ceiling; this is failure number `attempt`.
    Consult {
        /// 1-based failure count.
        attempt: u32,
    },
    /// The ceiling was already reached; the task must not run again.
    Open {
        /// Failures already recorded.
        attempts: u32,
    },
}

/// What the scheduler should do with the failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryVerdict {
    /// Put the original task back at the front of the queue.
    Requeue,
    /// Replace the task with these tasks, at the front of the queue.
    Replace(Vec<Task>),
    /// Drop the task and block its dependents.
    Skip,
    /// Fail the task permanently.
    Escalate {
        /// Error recorded as the failure reason.
        error: String,
    },
}

/// Circuit breaker plus re-planner dispatch for failed tasks.
///
/// Breaker records expire lazily: a record whose last failure is older than
/// the reset window is dropped the next time it is consulted.
pub struct RecoveryCoordinator {
    max_attempts: u32,
    reset_window: Duration,
    breakers: HashMap<String, BreakerState>,
    replanner: Option<Arc<dyn Replanner>>,
}

impl RecoveryCoordinator {
    /// A coordinator with no breaker records and no re-planner.
    pub fn new(max_attempts: u32, reset_window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            reset_window,
            breakers: HashMap::new(),
            replanner: None,
        }
    }

    /// Builder form of [`set_replanner`](Self::set_replanner).
    pub fn with_replanner(mut self, replanner: Arc<dyn Replanner>) -> Self {
        self.replanner = Some(replanner);
        self
    }

    /// Consult `replanner` on failures below the ceiling.
    pub fn set_replanner(&mut self, replanner: Arc<dyn Replanner>) {
        self.replanner = Some(replanner);
    }

    /// Failures allowed before the breaker opens.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Count a failure of `task_id`.
    pub fn record_failure(&mut self, task_id: &str) -> BreakerDecision {
        self.record_failure_at(task_id, Utc::now())
    }

    /// [`record_failure`](Self::record_failure) at an explicit time.
    pub fn record_failure_at(&mut self, task_id: &str, now: DateTime<Utc>) -> BreakerDecision {
        self.expire_at(task_id, now);
        let state = self
            .breakers
            .entry(task_id.to_string())
            .or_insert(BreakerState {
                attempts: 0,
                last_attempt_at: now,
            });

        if state.attempts >= self.max_attempts {
            warn!(task_id, attempts = state.attempts, "Circuit breaker open");
            return BreakerDecision::Open {
                attempts: state.attempts,
            };
        }

        state.attempts += 1;
        state.last_attempt_at = now;
        debug!(task_id, attempt = state.attempts, "Failure recorded");
        BreakerDecision::Consult {
            attempt: state.attempts,
        }
    }

    /// Ask the re-planner what to do. Call only after a
    /// [`BreakerDecision::Consult`].
    pub async fn consult(&self, context: &FailureContext) -> RecoveryVerdict {
        let task_id = context.task.id.as_str();
        let Some(replanner) = &self.replanner else {
            debug!(task_id, "No re-planner configured, retrying");
            return RecoveryVerdict::Requeue;
        };

        let plan = match replanner.replan(context).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(task_id, error = %e, "Re-planner failed, escalating");
                return RecoveryVerdict::Escalate {
                    error: format!("re-planner failed: {e}"),
                };
            }
        };

        info!(
            task_id,
            strategy = ?plan.strategy,
            modified = plan.modified_tasks.len(),
            "Recovery plan received"
        );
        match plan.strategy {
            RecoveryStrategy::Escalate => RecoveryVerdict::Escalate {
                error: context.error.clone(),
            },
            RecoveryStrategy::Skip => RecoveryVerdict::Skip,
            RecoveryStrategy::Retry | RecoveryStrategy::Reassign | RecoveryStrategy::Breakdown => {
                if plan.modified_tasks.is_empty() {
                    RecoveryVerdict::Requeue
                } else {
                    RecoveryVerdict::Replace(plan.modified_tasks)
                }
            }
        }
    }

    /// Current attempt count, honoring the reset window.
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts_at(task_id, Utc::now())
    }

    /// [`attempts`](Self::attempts) at an explicit time.
    pub fn attempts_at(&self, task_id: &str, now: DateTime<Utc>) -> u32 {
        self.breakers
            .get(task_id)
            .filter(|s| !self.is_expired(s, now))
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    /// Raw breaker record, expired or not.
    pub fn state(&self, task_id: &str) -> Option<&BreakerState> {
        self.breakers.get(task_id)
    }

    /// Drop every expired breaker record. Returns how many were dropped.
    pub fn prune_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.breakers.len();
        let window = self.reset_window;
        self.breakers
            .retain(|_, s| !expired(s, window, now));
        before - self.breakers.len()
    }

    /// Live attempt counts, sorted by task id.
    pub fn attempt_counts(&self) -> BTreeMap<String, u32> {
        let now = Utc::now();
        self.breakers
            .iter()
            .filter(|(_, s)| !self.is_expired(s, now))
            .map(|(id, s)| (id.clone(), s.attempts))
            .collect()
    }

    /// Seed attempt counts, e.g. from a snapshot. The reset window restarts at `now`.
    pub fn restore_attempts(&mut self, counts: &BTreeMap<String, u32>, now: DateTime<Utc>) {
        self.breakers = counts
            .iter()
            .filter(|(_, &attempts)| attempts > 0)
            .map(|(id, &attempts)| {
                (
                    id.clone(),
                    BreakerState {
                        attempts,
                        last_attempt_at: now,
                    },
                )
            })
            .collect();
    }

    fn expire_at(&mut self, task_id: &str, now: DateTime<Utc>) {
        let window = self.reset_window;
        if self
            .breakers
            .get(task_id)
            .is_some_and(|s| expired(s, window, now))
        {
            debug!(task_id, "Breaker record reset after quiet window");
            self.breakers.remove(task_id);
        }
    }

    fn is_expired(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        expired(state, self.reset_window, now)
    }
}

fn expired(state: &BreakerState, window: Duration, now: DateTime<Utc>) -> bool {
    (now - state.last_attempt_at)
        .to_std()
        .is_ok_and(|since| since >= window)
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("max_attempts", &self.max_attempts)
            .field("reset_window", &self.reset_window)
            .field("breakers", &self.breakers)
            .field("has_replanner", &self.replanner.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskCategory;
    use ensemble_core::EnsembleError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context(attempt: u32) -> FailureContext {
        FailureContext {
            task: Task::new("x", "Flaky", TaskCategory::Backend),
            error: "boom".into(),
            attempt,
            remaining_queue: vec![],
            completed: vec![],
            budget: BudgetLedger::default(),
        }
    }

    #[tokio::test]
    async fn test_fourth_failure_opens_breaker_without_replanner() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let replanner = replan_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RecoveryPlan::retry())
        });
        let mut coordinator = RecoveryCoordinator::new(3, Duration::from_secs(300))
            .with_replanner(Arc::new(replanner));

        for expected in 1..=3 {
            match coordinator.record_failure("x") {
                BreakerDecision::Consult { attempt } => {
                    assert_eq!(attempt, expected);
                    let verdict = coordinator.consult(&context(attempt)).await;
                    assert_eq!(verdict, RecoveryVerdict::Requeue);
                }
                other => panic!("breaker opened early: {other:?}"),
            }
        }

        assert_eq!(
            coordinator.record_failure("x"),
            BreakerDecision::Open { attempts: 3 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_breaker_resets_after_quiet_window() {
        let mut coordinator = RecoveryCoordinator::new(2, Duration::from_secs(60));
        let t0 = Utc::now();
        coordinator.record_failure_at("x", t0);
        coordinator.record_failure_at("x", t0 + chrono::Duration::seconds(10));
        assert_eq!(coordinator.attempts_at("x", t0 + chrono::Duration::seconds(20)), 2);

        let later = t0 + chrono::Duration::seconds(71);
        assert_eq!(coordinator.attempts_at("x", later), 0);
        assert_eq!(
            coordinator.record_failure_at("x", later),
            BreakerDecision::Consult { attempt: 1 }
        );
    }

    #[test]
    fn test_breakers_are_per_task() {
        let mut coordinator = RecoveryCoordinator::new(1, Duration::from_secs(60));
        assert_eq!(
            coordinator.record_failure("a"),
            BreakerDecision::Consult { attempt: 1 }
        );
        assert_eq!(
            coordinator.record_failure("b"),
            BreakerDecision::Consult { attempt: 1 }
        );
        assert_eq!(
            coordinator.record_failure("a"),
            BreakerDecision::Open { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_verdicts() {
        let mut coordinator = RecoveryCoordinator::new(3, Duration::from_secs(60));
        assert_eq!(coordinator.consult(&context(1)).await, RecoveryVerdict::Requeue);

        coordinator.set_replanner(Arc::new(replan_fn(|_| Ok(RecoveryPlan::skip()))));
        assert_eq!(coordinator.consult(&context(1)).await, RecoveryVerdict::Skip);

        coordinator.set_replanner(Arc::new(replan_fn(|_| Ok(RecoveryPlan::escalate()))));
        assert_eq!(
            coordinator.consult(&context(1)).await,
            RecoveryVerdict::Escalate {
                error: "boom".into()
            }
        );

        coordinator.set_replanner(Arc::new(replan_fn(|_| {
            Ok(RecoveryPlan::breakdown(vec![
                Task::new("x.1", "Part one", TaskCategory::Backend),
                Task::new("x.2", "Part two", TaskCategory::Backend),
            ]))
        })));
        match coordinator.consult(&context(1)).await {
            RecoveryVerdict::Replace(tasks) => assert_eq!(tasks.len(), 2),
            other => panic!("unexpected verdict: {other:?}"),
        }

        coordinator.set_replanner(Arc::new(replan_fn(|_| {
            Err(EnsembleError::Execution("planner offline".into()))
        })));
        match coordinator.consult(&context(1)).await {
            RecoveryVerdict::Escalate { error } => assert!(error.contains("planner offline")),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn test_restore_attempts() {
        let mut coordinator = RecoveryCoordinator::new(2, Duration::from_secs(60));
        let mut counts = BTreeMap::new();
        counts.insert("x".to_string(), 2);
        counts.insert("y".to_string(), 0);
        coordinator.restore_attempts(&counts, Utc::now());

        assert_eq!(coordinator.attempt_counts().len(), 1);
        assert!(matches!(
            coordinator.record_failure("x"),
            BreakerDecision::Open { .. }
        ));
    }

    #[test]
    fn test_prune_expired() {
        let mut coordinator = RecoveryCoordinator::new(3, Duration::from_secs(5));
        let t0 = Utc::now();
        coordinator.record_failure_at("old", t0);
        coordinator.record_failure_at("new", t0 + chrono::Duration::seconds(4));
        assert_eq!(coordinator.prune_expired_at(t0 + chrono::Duration::seconds(6)), 1);
        assert!(coordinator.state("new").is_some());
    }

    #[test]
    fn test_plan_deserializes_camel_case() {
        let plan: RecoveryPlan = serde_json::from_str(
            r#"{"strategy":"breakdown","modifiedTasks":[{"id":"a","name":"A","category":"docs"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.strategy, RecoveryStrategy::Breakdown);
        assert_eq!(plan.modified_tasks[0].id, "a");
    }
}
