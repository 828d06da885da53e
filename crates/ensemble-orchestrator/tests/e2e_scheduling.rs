//! End-to-end scheduling tests.
//!
//! Drives the full scheduler with recording mock workers and checks dispatch
//! order, the concurrency ceiling, worker exclusivity and reuse, budget
//! admission, circuit breaking, recovery plans and snapshot/resume.

use async_trait::async_trait;
use ensemble_orchestrator::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Recording mock worker
// ---------------------------------------------------------------------------

/// Shared log of everything the mock workers observed.
#[derive(Default)]
struct Recorder {
    delay_ms: u64,
    started: Mutex<Vec<String>>,
    completed: Mutex<HashSet<String>>,
    order_violations: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    exclusivity_violations: AtomicUsize,
    constructed: AtomicUsize,
    /// task id -> remaining failures before it succeeds (u32::MAX = always fails)
    failures: Mutex<HashMap<String, u32>>,
}

impl Recorder {
    fn with_delay(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delay_ms,
            ..Self::default()
        })
    }

    fn fail(self: &Arc<Self>, task_id: &str, times: u32) -> Arc<Self> {
        self.failures.lock().insert(task_id.to_string(), times);
        Arc::clone(self)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    fn consume_failure(&self, task_id: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(task_id) {
            None => false,
            Some(remaining) if *remaining == 0 => false,
            Some(remaining) if *remaining == u32::MAX => true,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
        }
    }
}

struct RecordingWorker {
    recorder: Arc<Recorder>,
    busy: AtomicBool,
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn execute(&self, task: &Task) -> EnsembleResult<TaskOutput> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.recorder
                .exclusivity_violations
                .fetch_add(1, Ordering::SeqCst);
        }

        {
            let completed = self.recorder.completed.lock();
            if task.dependencies.iter().any(|d| !completed.contains(d)) {
                self.recorder.order_violations.lock().push(task.id.clone());
            }
        }
        self.recorder.started.lock().push(task.id.clone());
        let now_active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak.fetch_max(now_active, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(self.recorder.delay_ms)).await;

        let fails = self.recorder.consume_failure(&task.id);
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);

        if fails {
            return Err(EnsembleError::Execution(format!("{} failed", task.id)));
        }
        self.recorder.completed.lock().insert(task.id.clone());
        let mut output = TaskOutput::new(task.estimated_cost);
        for file in &task.file_targets {
            output = output.with_action(FileAction::create(file.clone()));
        }
        Ok(output)
    }
}

fn registry(recorder: &Arc<Recorder>) -> WorkerRegistry {
    let recorder = Arc::clone(recorder);
    let mut registry = WorkerRegistry::new();
    registry.register_all(move |_| {
        recorder.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingWorker {
            recorder: Arc::clone(&recorder),
            busy: AtomicBool::new(false),
        }) as Box<dyn Worker>)
    });
    registry
}

fn task(id: &str, priority: Priority, deps: &[&str]) -> Task {
    Task::new(id, id.to_uppercase(), TaskCategory::Backend)
        .with_priority(priority)
        .with_cost(0.1)
        .with_dependencies(deps.iter().copied())
}

fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Ordering and concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_diamond_runs_in_waves_under_concurrency_cap() {
    let recorder = Recorder::with_delay(30);
    let plan = Plan::from_tasks(vec![
        task("a", Priority::High, &[]),
        task("b", Priority::Medium, &["a"]),
        task("c", Priority::Medium, &["a"]),
        task("d", Priority::Low, &["b", "c"]),
    ]);
    let config = OrchestratorConfig::default().with_max_concurrent_tasks(2);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed_task_count, 4);
    let started = recorder.started();
    assert_eq!(started[0], "a");
    assert_eq!(started[3], "d");
    assert!(started[1..3].contains(&"b".to_string()));
    assert!(started[1..3].contains(&"c".to_string()));
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
    assert!(recorder.order_violations.lock().is_empty());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_ceiling() {
    let recorder = Recorder::with_delay(5);
    let tasks: Vec<Task> = (0..24)
        .map(|i| {
            let deps: Vec<String> = if i < 4 {
                vec![]
            } else {
                vec![format!("t{}", i / 2)]
            };
            Task::new(format!("t{i}"), format!("Task {i}"), TaskCategory::ALL[i % 7])
                .with_cost(0.05)
                .with_dependencies(deps)
        })
        .collect();
    let config = OrchestratorConfig::default()
        .with_max_concurrent_tasks(3)
        .with_budget(100.0);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();

    let summary = orchestrator.execute(&Plan::from_tasks(tasks)).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed_task_count, 24);
    assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
    assert!(recorder.order_violations.lock().is_empty());
    assert_eq!(recorder.exclusivity_violations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_priority_breaks_ties_among_ready_tasks() {
    let recorder = Recorder::with_delay(1);
    let plan = Plan::from_tasks(vec![
        task("low", Priority::Low, &[]),
        task("high", Priority::High, &[]),
        task("medium", Priority::Medium, &[]),
    ]);
    let config = OrchestratorConfig::default().with_max_concurrent_tasks(1);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();

    orchestrator.execute(&plan).await.unwrap();

    assert_eq!(recorder.started(), vec!["high", "medium", "low"]);
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sequential_tasks_reuse_one_worker() {
    let recorder = Recorder::with_delay(1);
    let plan = Plan::from_tasks(vec![
        task("one", Priority::Medium, &[]),
        task("two", Priority::Medium, &["one"]),
        task("three", Priority::Medium, &["two"]),
    ]);
    let mut orchestrator =
        Orchestrator::new(OrchestratorConfig::default(), registry(&recorder)).unwrap();
    let mut events = orchestrator.subscribe();

    orchestrator.execute(&plan).await.unwrap();

    let workers: HashSet<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::TaskAssigned { worker_id, .. } => Some(worker_id),
            _ => None,
        })
        .collect();
    assert_eq!(workers.len(), 1);
    assert_eq!(recorder.constructed.load(Ordering::SeqCst), 1);
    let stats = orchestrator.pool().stats(TaskCategory::Backend);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_pool_limit_caps_parallel_workers_per_category() {
    let recorder = Recorder::with_delay(10);
    let plan = Plan::from_tasks(
        (0..6)
            .map(|i| task(&format!("w{i}"), Priority::Medium, &[]))
            .collect(),
    );
    let mut config = OrchestratorConfig::default().with_max_concurrent_tasks(6);
    config.pool.max_workers_per_category = 2;
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.constructed.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.exclusivity_violations.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Budget admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unaffordable_task_is_deferred_not_dispatched() {
    let recorder = Recorder::with_delay(1);
    let plan = Plan::from_tasks(vec![
        task("warmup", Priority::High, &[]).with_cost(0.95),
        task("op1", Priority::Medium, &["warmup"]).with_cost(0.10),
    ]);
    let config = OrchestratorConfig::default().with_budget(1.0);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();
    let mut events = orchestrator.subscribe();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert_eq!(recorder.started(), vec!["warmup"]);
    assert!(!summary.success);
    assert_eq!(summary.failed_task_count, 0);
    assert_eq!(summary.blocked_task_count, 1);
    assert_eq!(summary.failed_tasks[0].reason, FailureReason::BudgetExhausted);
    assert!((summary.total_cost - 0.95).abs() < 1e-9);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::TaskDeferred { task_id, .. } if task_id == "op1"
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::TaskAssigned { task_id, .. } if task_id == "op1"
    )));
    let warnings = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::BudgetWarning { .. }))
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn test_deferred_task_runs_once_budget_frees_up() {
    // "big" overestimates; its commit frees room for "later"
    struct CheapWorker;

    #[async_trait]
    impl Worker for CheapWorker {
        async fn execute(&self, task: &Task) -> EnsembleResult<TaskOutput> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(TaskOutput::new(task.estimated_cost / 4.0))
        }
    }

    let plan = Plan::from_tasks(vec![
        task("big", Priority::High, &[]).with_cost(0.8),
        task("later", Priority::Low, &[]).with_cost(0.5),
    ]);
    let config = OrchestratorConfig::default()
        .with_budget(1.0)
        .with_max_concurrent_tasks(2);
    let registry = WorkerRegistry::new().with(TaskCategory::Backend, |_| {
        Ok(Box::new(CheapWorker) as Box<dyn Worker>)
    });
    let mut orchestrator = Orchestrator::new(config, registry).unwrap();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed_task_count, 2);
    assert!((summary.total_cost - 0.325).abs() < 1e-9);
    assert!(orchestrator.budget().check_invariant().is_ok());
}

// ---------------------------------------------------------------------------
// Failure recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_circuit_breaker_opens_after_max_attempts() {
    let recorder = Recorder::with_delay(1).fail("x", u32::MAX);
    let plan = Plan::from_tasks(vec![
        task("x", Priority::Medium, &[]),
        task("after-x", Priority::Medium, &["x"]),
        task("other", Priority::Medium, &[]),
    ]);
    let replans = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&replans);
    let config = OrchestratorConfig::default().with_max_attempts(3);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder))
        .unwrap()
        .with_replanner(replan_fn(move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.task.id, "x");
            Ok(RecoveryPlan::retry())
        }));
    let mut events = orchestrator.subscribe();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert_eq!(replans.load(Ordering::SeqCst), 3);
    let runs = recorder.started().iter().filter(|t| *t == "x").count();
    assert_eq!(runs, 4);
    assert!(!summary.success);
    assert_eq!(summary.completed_task_count, 1);
    assert_eq!(summary.failed_task_count, 1);
    assert_eq!(summary.blocked_task_count, 1);

    let x = summary
        .failed_tasks
        .iter()
        .find(|f| f.task_id == "x")
        .unwrap();
    assert_eq!(x.reason.code(), "circuit_breaker_open");

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::CircuitBreakerOpen { task_id, attempts: 3, .. } if task_id == "x"
    )));
    let failures = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::TaskFailed { .. }))
        .count();
    assert_eq!(failures, 4);
}

#[tokio::test]
async fn test_transient_failure_recovers_with_default_retry() {
    let recorder = Recorder::with_delay(1).fail("flaky", 2);
    let plan = Plan::from_tasks(vec![
        task("flaky", Priority::Medium, &[]),
        task("next", Priority::Medium, &["flaky"]),
    ]);
    let mut orchestrator =
        Orchestrator::new(OrchestratorConfig::default(), registry(&recorder)).unwrap();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(recorder.started(), vec!["flaky", "flaky", "flaky", "next"]);
    assert_eq!(orchestrator.pool().stats(TaskCategory::Backend).discarded, 2);
}

#[tokio::test]
async fn test_breakdown_replaces_task_and_rewires_dependents() {
    let recorder = Recorder::with_delay(1).fail("big", 1);
    let plan = Plan::from_tasks(vec![
        task("big", Priority::Medium, &[]),
        task("after", Priority::Medium, &["big"]),
    ]);
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry(&recorder))
        .unwrap()
        .with_replanner(replan_fn(|ctx| {
            Ok(RecoveryPlan::breakdown(vec![
                Task::new(format!("{}-2", ctx.task.id), "second half", TaskCategory::Backend)
                    .with_dependencies([format!("{}-1", ctx.task.id)]),
                Task::new(format!("{}-1", ctx.task.id), "first half", TaskCategory::Backend),
            ]))
        }));

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.completed_task_count, 3);
    assert_eq!(recorder.started(), vec!["big", "big-1", "big-2", "after"]);
    assert!(recorder.order_violations.lock().is_empty());
    assert_eq!(orchestrator.queue().superseded()["big"].len(), 2);
}

#[tokio::test]
async fn test_skip_blocks_dependents() {
    let recorder = Recorder::with_delay(1).fail("doomed", u32::MAX);
    let plan = Plan::from_tasks(vec![
        task("doomed", Priority::Medium, &[]),
        task("child", Priority::Medium, &["doomed"]),
        task("grandchild", Priority::Medium, &["child"]),
        task("unrelated", Priority::Medium, &[]),
    ]);
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry(&recorder))
        .unwrap()
        .with_replanner(replan_fn(|_| Ok(RecoveryPlan::skip())));

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.completed_task_count, 1);
    assert_eq!(summary.failed_task_count, 0);
    assert_eq!(summary.blocked_task_count, 3);
    assert!(!recorder.started().contains(&"child".to_string()));
}

#[tokio::test]
async fn test_invalid_recovery_plan_escalates() {
    let recorder = Recorder::with_delay(1).fail("a", 1);
    let plan = Plan::from_tasks(vec![task("a", Priority::Medium, &[])]);
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry(&recorder))
        .unwrap()
        .with_replanner(replan_fn(|_| {
            Ok(RecoveryPlan::of(RecoveryStrategy::Reassign).with_tasks(vec![
                Task::new("a-fix", "fix", TaskCategory::Backend).with_dependencies(["missing"]),
            ]))
        }));

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert_eq!(summary.failed_task_count, 1);
    assert_eq!(summary.failed_tasks[0].reason.code(), "escalated");
}

// ---------------------------------------------------------------------------
// Summary, snapshot and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_merged_feature_plans_run_in_constraint_order() {
    let recorder = Recorder::with_delay(1);
    let auth = FeaturePlan::new(
        "auth",
        vec![
            task("schema", Priority::Medium, &[]).with_files(["db/auth.sql"]),
            task("api", Priority::Medium, &["schema"]).with_files(["src/auth.rs"]),
        ],
    );
    let billing = FeaturePlan::new(
        "billing",
        vec![task("api", Priority::High, &[]).with_files(["src/billing.rs", "src/auth.rs"])],
    );
    let plan = Plan::merge(vec![auth, billing], vec![FeatureConstraint::new("auth", "billing")]);
    let config = OrchestratorConfig::default().with_max_concurrent_tasks(4);
    let mut orchestrator = Orchestrator::new(config, registry(&recorder)).unwrap();

    let summary = orchestrator.execute(&plan).await.unwrap();

    assert_eq!(
        recorder.started(),
        vec!["auth:schema", "auth:api", "billing:api"]
    );
    assert_eq!(
        summary.files_created,
        vec!["db/auth.sql", "src/auth.rs", "src/billing.rs"]
    );
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_completed_work() {
    let first = Recorder::with_delay(1);
    let plan = Plan::from_tasks(vec![
        task("a", Priority::Medium, &[]),
        task("b", Priority::Medium, &["a"]),
        task("c", Priority::Medium, &["b"]),
    ]);
    let checkpoints: Arc<Mutex<Vec<SchedulerSnapshot>>> = Arc::default();
    let sink = Arc::clone(&checkpoints);
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry(&first))
        .unwrap()
        .with_checkpoint_hook(move |snapshot| sink.lock().push(snapshot.clone()));
    orchestrator.execute(&plan).await.unwrap();

    let after_a = checkpoints
        .lock()
        .iter()
        .find(|s| s.completed == vec!["a".to_string()])
        .cloned()
        .unwrap();
    let json = after_a.to_json().unwrap();

    let second = Recorder::with_delay(1);
    let mut resumed = Orchestrator::new(OrchestratorConfig::default(), registry(&second)).unwrap();
    resumed
        .restore(&SchedulerSnapshot::from_json(&json).unwrap())
        .unwrap();
    // "a" finished in the first run
    second.completed.lock().insert("a".to_string());
    let summary = resumed.run().await;

    assert!(summary.success);
    assert_eq!(summary.completed_task_count, 3);
    assert_eq!(second.started(), vec!["b", "c"]);
    assert!((summary.total_cost - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_restore_preserves_breaker_attempts() {
    let recorder = Recorder::with_delay(1).fail("x", u32::MAX);
    let plan = Plan::from_tasks(vec![task("x", Priority::Medium, &[])]);
    let config = OrchestratorConfig::default().with_max_attempts(2);

    let mut orchestrator = Orchestrator::new(config.clone(), registry(&recorder)).unwrap();
    orchestrator.load_plan(&plan).unwrap();
    let mut snapshot = orchestrator.snapshot();
    snapshot.breaker_attempts.insert("x".to_string(), 2);

    let mut resumed = Orchestrator::new(config, registry(&recorder)).unwrap();
    resumed.restore(&snapshot).unwrap();
    let summary = resumed.run().await;

    assert_eq!(recorder.started(), vec!["x"]);
    assert_eq!(summary.failed_tasks[0].reason.code(), "circuit_breaker_open");
}

#[tokio::test]
async fn test_monitor_tracks_categories() {
    let recorder = Recorder::with_delay(1);
    let plan = Plan::from_tasks(vec![
        Task::new("ui", "UI", TaskCategory::Frontend).with_cost(0.2),
        Task::new("docs", "Docs", TaskCategory::Docs).with_cost(0.1),
    ]);
    let mut orchestrator =
        Orchestrator::new(OrchestratorConfig::default(), registry(&recorder)).unwrap();
    orchestrator.execute(&plan).await.unwrap();

    let frontend = orchestrator
        .monitor()
        .get_state(TaskCategory::Frontend)
        .await
        .unwrap();
    assert_eq!(frontend.metrics.completed, 1);
    assert!((frontend.metrics.total_cost - 0.2).abs() < 1e-9);
    let json = orchestrator.monitor().to_json().await;
    assert_eq!(json["aggregate"]["completed"], 2);
}
