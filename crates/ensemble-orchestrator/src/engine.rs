use crate::budget::BudgetController;
use crate::config::OrchestratorConfig;
use crate::graph::{order_extension, DependencyGraph, Plan};
use crate::monitor::WorkerMonitor;
use crate::pool::{WorkerLease, WorkerPool, WorkerRegistry};
use crate::recovery::{
    BreakerDecision, FailureContext, RecoveryCoordinator, RecoveryVerdict, Replanner,
};
use crate::snapshot::SchedulerSnapshot;
use crate::task_queue::TaskQueue;
use crate::types::{
    ExecutionSummary, FailureReason, FileActionKind, Task, TaskCategory, TaskOutput, TaskStatus,
};
use chrono::Utc;
use ensemble_core::{EnsembleError, EnsembleResult, EventBus, OrchestratorEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Called with a fresh snapshot after every reconcile step.
pub type CheckpointHook = Arc<dyn Fn(&SchedulerSnapshot) + Send + Sync>;

/// Why a ready task was left pending on its last dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferral {
    Budget,
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Dispatched,
    Deferred,
    /// The task could not be started and went through recovery.
    Failed,
}

/// What one dispatch pass achieved.
#[derive(Debug, Default, Clone, Copy)]
struct DispatchPass {
    dispatched: usize,
    failed: usize,
}

/// Outcome of one dispatched execution, posted by the worker task.
struct Completion {
    task_id: String,
    category: TaskCategory,
    worker_id: Uuid,
    /// `None` when the worker task died without handing the lease back.
    lease: Option<WorkerLease>,
    result: EnsembleResult<TaskOutput>,
    elapsed_ms: u64,
}

/// Posts a failure for its task if dropped before [`finish`](Self::finish),
/// so a panicking worker never leaves the scheduler waiting forever.
struct CompletionGuard {
    tx: mpsc::UnboundedSender<Completion>,
    task_id: String,
    category: TaskCategory,
    worker_id: Uuid,
    started: Instant,
    sent: bool,
}

impl CompletionGuard {
    fn finish(mut self, lease: WorkerLease, result: EnsembleResult<TaskOutput>) {
        self.sent = true;
        let _ = self.tx.send(Completion {
            task_id: std::mem::take(&mut self.task_id),
            category: self.category,
            worker_id: self.worker_id,
            lease: Some(lease),
            result,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let _ = self.tx.send(Completion {
            task_id: std::mem::take(&mut self.task_id),
            category: self.category,
            worker_id: self.worker_id,
            lease: None,
            result: Err(EnsembleError::Execution(
                "worker task ended without reporting a result".to_string(),
            )),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

/// The task scheduler.
///
/// Owns the task queue, the recovery coordinator and the budget/pool handles,
/// and drives a plan to completion: dispatch ready tasks up to the concurrency
/// ceiling, wait for any in-flight execution to resolve, reconcile, repeat.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<WorkerRegistry>,
    pool: Arc<WorkerPool>,
    budget: Arc<BudgetController>,
    recovery: RecoveryCoordinator,
    queue: TaskQueue,
    monitor: WorkerMonitor,
    events: EventBus,
    checkpoint: Option<CheckpointHook>,
    deferrals: HashMap<String, Deferral>,
    budget_warned: bool,
}

impl Orchestrator {
    /// Build a scheduler over `registry`. Fails if `config` does not validate.
    pub fn new(config: OrchestratorConfig, registry: WorkerRegistry) -> EnsembleResult<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        let budget = Arc::new(BudgetController::new(
            config.budget.total,
            config.budget.warning_threshold,
        ));
        let recovery =
            RecoveryCoordinator::new(config.recovery.max_attempts, config.recovery.reset_window());
        let events = EventBus::new(config.event_capacity);

        Ok(Self {
            config,
            registry: Arc::new(registry),
            pool,
            budget,
            recovery,
            queue: TaskQueue::new(),
            monitor: WorkerMonitor::new(),
            events,
            checkpoint: None,
            deferrals: HashMap::new(),
            budget_warned: false,
        })
    }

    /// Consult `replanner` on task failures below the breaker ceiling.
    pub fn with_replanner<R>(mut self, replanner: R) -> Self
    where
        R: Replanner + 'static,
    {
        self.recovery.set_replanner(Arc::new(replanner));
        self
    }

    /// Call `hook` with a fresh snapshot after every reconcile step.
    pub fn with_checkpoint_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SchedulerSnapshot) + Send + Sync + 'static,
    {
        self.checkpoint = Some(Arc::new(hook));
        self
    }

    /// Validated engine configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The task queue as it stands.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Shared worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Shared budget controller.
    pub fn budget(&self) -> &Arc<BudgetController> {
        &self.budget
    }

    /// Per-category worker metrics.
    pub fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    /// Event bus the scheduler publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Build the dependency graph for `plan` and queue its tasks in execution
    /// order, replacing any queued work. Returns the execution order.
    ///
    /// Planning errors surface here, before anything is dispatched.
    pub fn load_plan(&mut self, plan: &Plan) -> EnsembleResult<Vec<String>> {
        let graph = DependencyGraph::build(plan)?;
        let order: Vec<String> = graph
            .execution_order()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.queue = TaskQueue::from_records(graph.into_records());
        self.deferrals.clear();
        info!(tasks = order.len(), "Plan loaded");
        Ok(order)
    }

    /// Plan and run in one step.
    pub async fn execute(&mut self, plan: &Plan) -> EnsembleResult<ExecutionSummary> {
        self.load_plan(plan)?;
        Ok(self.run().await)
    }

    /// Drive the queued work until nothing is pending or in flight.
    ///
    /// Never fails: task failures, deferrals and stalls all end up in the
    /// returned summary.
    pub async fn run(&mut self) -> ExecutionSummary {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reclaimer = self
            .pool
            .spawn_reclaimer(self.config.pool.reclaim_interval());

        info!(
            tasks = self.queue.total_count(),
            pending = self.queue.pending_count(),
            max_concurrent = self.config.max_concurrent_tasks,
            budget = self.budget.total(),
            "Scheduler: starting run"
        );

        loop {
            let pass = self.dispatch_ready(&tx).await;
            if self.queue.is_done() {
                break;
            }
            if self.queue.active_count() == 0 {
                if pass.dispatched == 0 && pass.failed == 0 {
                    self.abandon_stalled();
                    break;
                }
                continue;
            }

            let Some(first) = rx.recv().await else {
                break;
            };
            let mut resolved = vec![first];
            while let Ok(next) = rx.try_recv() {
                resolved.push(next);
            }
            let last_task = resolved.last().map(|c| c.task_id.clone());
            for completion in resolved {
                self.reconcile(completion).await;
            }

            self.check_budget_health(last_task.as_deref());
            self.run_checkpoint();
        }

        reclaimer.abort();
        let summary = self.summary(started.elapsed().as_millis() as u64);
        info!(
            success = summary.success,
            completed = summary.completed_task_count,
            failed = summary.failed_task_count,
            blocked = summary.blocked_task_count,
            total_cost = summary.total_cost,
            duration_ms = summary.duration_ms,
            "Scheduler: run finished"
        );
        summary
    }

    /// Dispatch ready tasks in order until the concurrency ceiling is reached.
    /// A deferred task does not use up a slot; the next ready task is tried.
    async fn dispatch_ready(&mut self, tx: &mpsc::UnboundedSender<Completion>) -> DispatchPass {
        let ready = self.queue.dispatch_order();
        let mut pass = DispatchPass::default();

        for id in ready {
            if self.queue.active_count() >= self.config.max_concurrent_tasks {
                self.queue.mark_deferred(&id);
                continue;
            }
            match self.try_dispatch(&id, tx).await {
                DispatchOutcome::Dispatched => pass.dispatched += 1,
                DispatchOutcome::Failed => pass.failed += 1,
                DispatchOutcome::Deferred => {}
            }
        }
        pass
    }

    async fn try_dispatch(
        &mut self,
        id: &str,
        tx: &mpsc::UnboundedSender<Completion>,
    ) -> DispatchOutcome {
        let Some(task) = self
            .queue
            .get(id)
            .filter(|r| r.status == TaskStatus::Ready)
            .map(|r| r.task.clone())
        else {
            return DispatchOutcome::Deferred;
        };
        let category = task.category;

        let registry = Arc::clone(&self.registry);
        let lease = match self
            .pool
            .try_acquire(category, || registry.create(category))
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.defer(id, Deferral::Pool, format!("no {category} worker available"));
                return DispatchOutcome::Deferred;
            }
            Err(e) => {
                error!(
                    task_id = %id,
                    category = %category,
                    error = %e,
                    "Worker construction failed"
                );
                self.handle_failure(id, e.to_string()).await;
                return DispatchOutcome::Failed;
            }
        };

        if let Err(e) = self.budget.reserve(id, task.estimated_cost) {
            self.pool.release(lease, false);
            self.defer(id, Deferral::Budget, e.to_string());
            return DispatchOutcome::Deferred;
        }

        self.queue.mark_active(id);
        self.deferrals.remove(id);
        self.monitor.start_task(category, id).await;

        let worker_id = lease.id();
        info!(
            task_id = %id,
            category = %category,
            worker_id = %worker_id,
            reused = lease.is_reused(),
            estimated_cost = task.estimated_cost,
            "Task dispatched"
        );
        self.events.publish(OrchestratorEvent::TaskAssigned {
            task_id: id.to_string(),
            worker_id: worker_id.to_string(),
            category: category.to_string(),
            at: Utc::now(),
        });

        let guard = CompletionGuard {
            tx: tx.clone(),
            task_id: id.to_string(),
            category,
            worker_id,
            started: Instant::now(),
            sent: false,
        };
        tokio::spawn(async move {
            let result = lease.execute(&task).await;
            guard.finish(lease, result);
        });
        DispatchOutcome::Dispatched
    }

    fn defer(&mut self, id: &str, cause: Deferral, reason: String) {
        debug!(task_id = %id, ?cause, %reason, "Task deferred");
        self.queue.mark_deferred(id);
        self.deferrals.insert(id.to_string(), cause);
        self.events.publish(OrchestratorEvent::TaskDeferred {
            task_id: id.to_string(),
            reason,
            at: Utc::now(),
        });
    }

    async fn reconcile(&mut self, completion: Completion) {
        let Completion {
            task_id,
            category,
            worker_id,
            lease,
            result,
            elapsed_ms,
        } = completion;

        match lease {
            Some(lease) => self.pool.release(lease, result.is_err()),
            None => self.pool.discard(category, worker_id),
        }

        match result {
            Ok(output) => {
                let outcome = self.budget.commit(&task_id, output.cost);
                if let Some(EnsembleError::BudgetOverrun {
                    committed, total, ..
                }) = &outcome.overrun
                {
                    self.events.publish(OrchestratorEvent::BudgetOverrun {
                        task_id: task_id.clone(),
                        committed: *committed,
                        total: *total,
                        at: Utc::now(),
                    });
                }
                self.monitor
                    .finish_task(category, &task_id, true, output.cost, elapsed_ms)
                    .await;
                info!(
                    task_id = %task_id,
                    cost = output.cost,
                    variance = outcome.variance(),
                    files = output.file_actions.len(),
                    elapsed_ms,
                    "Task completed"
                );
                self.events.publish(OrchestratorEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    cost: output.cost,
                    at: Utc::now(),
                });
                self.queue.mark_completed(&task_id, output);
            }
            Err(e) => {
                self.budget.release(&task_id);
                self.monitor
                    .finish_task(category, &task_id, false, 0.0, elapsed_ms)
                    .await;
                warn!(task_id = %task_id, error = %e, elapsed_ms, "Task failed");
                self.handle_failure(&task_id, e.to_string()).await;
            }
        }
    }

    /// Route a failed task through the circuit breaker and the re-planner.
    async fn handle_failure(&mut self, id: &str, error: String) {
        match self.recovery.record_failure(id) {
            BreakerDecision::Open { attempts } => {
                self.events.publish(OrchestratorEvent::TaskFailed {
                    task_id: id.to_string(),
                    reason: error.clone(),
                    attempt: attempts + 1,
                    at: Utc::now(),
                });
                self.events.publish(OrchestratorEvent::CircuitBreakerOpen {
                    task_id: id.to_string(),
                    attempts,
                    at: Utc::now(),
                });
                self.fail_permanently(
                    id,
                    FailureReason::CircuitBreakerOpen {
                        attempts,
                        last_error: error,
                    },
                );
            }
            BreakerDecision::Consult { attempt } => {
                self.events.publish(OrchestratorEvent::TaskFailed {
                    task_id: id.to_string(),
                    reason: error.clone(),
                    attempt,
                    at: Utc::now(),
                });
                let Some(task) = self.queue.get(id).map(|r| r.task.clone()) else {
                    return;
                };
                let context = FailureContext {
                    task,
                    error,
                    attempt,
                    remaining_queue: self.queue.pending_ids(),
                    completed: self.queue.completed_ids().to_vec(),
                    budget: self.budget.ledger(),
                };
                let verdict = self.recovery.consult(&context).await;
                self.apply_verdict(id, verdict);
            }
        }
    }

    fn apply_verdict(&mut self, id: &str, verdict: RecoveryVerdict) {
        match verdict {
            RecoveryVerdict::Requeue => {
                info!(task_id = %id, "Task re-queued for retry");
                self.queue.requeue_front(id);
            }
            RecoveryVerdict::Replace(tasks) => match self.validate_replacements(id, tasks) {
                Ok(ordered) => {
                    info!(
                        task_id = %id,
                        replacements = ?ordered.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
                        "Task replaced by recovery plan"
                    );
                    self.queue.replace(id, ordered);
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Recovery plan rejected");
                    self.fail_permanently(
                        id,
                        FailureReason::Escalated {
                            error: format!("invalid recovery plan: {e}"),
                        },
                    );
                }
            },
            RecoveryVerdict::Skip => self.fail_permanently(id, FailureReason::Skipped),
            RecoveryVerdict::Escalate { error } => {
                self.fail_permanently(id, FailureReason::Escalated { error })
            }
        }
    }

    /// Check recovery tasks against the live queue and order them.
    fn validate_replacements(&self, original: &str, tasks: Vec<Task>) -> EnsembleResult<Vec<Task>> {
        if tasks.is_empty() {
            return Err(EnsembleError::Planning("empty replacement set".into()));
        }
        for task in &tasks {
            if task.id != original && self.queue.knows(&task.id) {
                return Err(EnsembleError::Planning(format!(
                    "replacement id '{}' is already in use",
                    task.id
                )));
            }
        }

        let downstream = self.queue.transitive_dependents(original);
        for task in &tasks {
            for dep in &task.dependencies {
                if downstream.contains(dep) {
                    return Err(EnsembleError::Planning(format!(
                        "replacement '{}' depends on '{dep}', which waits for '{original}'",
                        task.id
                    )));
                }
            }
        }

        // The original is being replaced, so only live tasks other than it count.
        order_extension(tasks, |dep| {
            dep != original
                && self
                    .queue
                    .get(dep)
                    .is_some_and(|r| r.status != TaskStatus::Failed)
        })
    }

    fn fail_permanently(&mut self, id: &str, reason: FailureReason) {
        if reason.is_recovery_exhausted() {
            error!(task_id = %id, reason = %reason, "Task permanently failed");
        } else {
            warn!(task_id = %id, reason = %reason, "Task dropped");
        }
        let blocked = self.queue.mark_failed(id, reason);
        if !blocked.is_empty() {
            warn!(task_id = %id, blocked = ?blocked, "Dependents blocked");
        }
    }

    /// Nothing is in flight and nothing could be dispatched: fail everything
    /// still pending with the reason that held it back.
    fn abandon_stalled(&mut self) {
        let reasons: HashMap<String, FailureReason> = self
            .queue
            .pending_ids()
            .into_iter()
            .filter_map(|id| {
                let record = self.queue.get(&id)?;
                let reason = match self.deferrals.get(&id) {
                    Some(Deferral::Budget) => FailureReason::BudgetExhausted,
                    Some(Deferral::Pool) => FailureReason::NoWorkerCapacity,
                    None => record
                        .task
                        .dependencies
                        .iter()
                        .find(|d| !self.queue.is_completed(d))
                        .map(|d| FailureReason::DependencyFailed {
                            dependency: d.clone(),
                        })
                        .unwrap_or(FailureReason::NoWorkerCapacity),
                };
                Some((id, reason))
            })
            .collect();

        let abandoned = self.queue.abandon_pending(|record| {
            reasons
                .get(record.id())
                .cloned()
                .unwrap_or(FailureReason::NoWorkerCapacity)
        });
        error!(
            abandoned = abandoned.len(),
            remaining_budget = self.budget.remaining(),
            "Scheduler stalled with no work in flight"
        );
        self.check_budget_health(None);
        self.run_checkpoint();
    }

    /// Raise a budget warning the first time remaining budget drops below the
    /// threshold. Re-arms once the ratio recovers.
    fn check_budget_health(&mut self, task_id: Option<&str>) {
        if !self.budget.is_below_warning() {
            self.budget_warned = false;
            return;
        }
        if self.budget_warned {
            return;
        }
        self.budget_warned = true;
        let remaining = self.budget.remaining();
        let total = self.budget.total();
        warn!(
            remaining,
            total,
            threshold = self.budget.warning_threshold(),
            "Budget running low"
        );
        self.events.publish(OrchestratorEvent::BudgetWarning {
            task_id: task_id.map(str::to_string),
            remaining,
            total,
            at: Utc::now(),
        });
    }

    fn run_checkpoint(&self) {
        if let Some(hook) = &self.checkpoint {
            hook(&self.snapshot());
        }
    }

    /// Capture the resumable state of the run.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot::capture(
            &self.queue,
            self.recovery.attempt_counts(),
            self.budget.committed(),
        )
    }

    /// Replace the queue, breaker counts and committed budget with a snapshot.
    pub fn restore(&mut self, snapshot: &SchedulerSnapshot) -> EnsembleResult<()> {
        let queue = snapshot.to_queue()?;
        self.queue = queue;
        self.recovery
            .restore_attempts(&snapshot.breaker_attempts, Utc::now());
        self.budget.restore_committed(snapshot.committed_budget);
        self.deferrals.clear();
        self.budget_warned = false;
        info!(
            pending = self.queue.pending_count(),
            completed = self.queue.completed_count(),
            committed = snapshot.committed_budget,
            "Scheduler state restored"
        );
        Ok(())
    }

    /// Summarize the queue as it stands.
    pub fn summary(&self, duration_ms: u64) -> ExecutionSummary {
        let failed_tasks = self.queue.failed().to_vec();
        let failed_task_count = failed_tasks
            .iter()
            .filter(|f| f.reason.is_recovery_exhausted())
            .count();
        let blocked_task_count = failed_tasks.len() - failed_task_count;

        let mut files_created = Vec::new();
        let mut files_modified = Vec::new();
        let mut seen_created = HashSet::new();
        let mut seen_modified = HashSet::new();
        for id in self.queue.completed_ids() {
            let Some(output) = self.queue.get(id).and_then(|r| r.result.as_ref()) else {
                continue;
            };
            for action in &output.file_actions {
                let (files, seen) = match action.kind {
                    FileActionKind::Create => (&mut files_created, &mut seen_created),
                    FileActionKind::Modify => (&mut files_modified, &mut seen_modified),
                };
                if seen.insert(action.path.clone()) {
                    files.push(action.path.clone());
                }
            }
        }

        ExecutionSummary {
            success: failed_tasks.is_empty() && self.queue.pending_count() == 0,
            completed_task_count: self.queue.completed_count(),
            failed_task_count,
            blocked_task_count,
            failed_tasks,
            files_created,
            files_modified,
            total_cost: self.budget.committed(),
            duration_ms,
        }
    }
}
