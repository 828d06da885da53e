use crate::types::{FailedTask, FailureReason, Task, TaskOutput, TaskRecord, TaskStatus};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};

/// The scheduler's task records plus the ordered pending queue.
///
/// Queue order encodes topological + priority order from planning; recovery
/// work is inserted at the front.
#[derive(Debug, Default)]
pub struct TaskQueue {
    records: HashMap<String, TaskRecord>,
    pending: VecDeque<String>,
    active: Vec<String>,
    completed: Vec<String>,
    failed: Vec<FailedTask>,
    /// original id -> ids of the tasks that replaced it
    superseded: HashMap<String, Vec<String>>,
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue from records in execution order.
    ///
    /// Terminal records are filed as completed/failed; `Active` records are
    /// treated as interrupted and go back to the pending queue.
    pub fn from_records(records: Vec<TaskRecord>) -> Self {
        let mut queue = Self::new();
        for record in records {
            queue.insert(record);
        }
        queue
    }

    fn insert(&mut self, mut record: TaskRecord) {
        let id = record.id().to_string();
        match record.status {
            TaskStatus::Completed => self.completed.push(id.clone()),
            TaskStatus::Failed => {
                let reason = record
                    .failure
                    .clone()
                    .unwrap_or(FailureReason::Escalated {
                        error: "unknown".to_string(),
                    });
                self.failed.push(FailedTask {
                    task_id: id.clone(),
                    reason,
                });
            }
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Active => {
                record.status = TaskStatus::Pending;
                record.started_at = None;
                self.pending.push_back(id.clone());
            }
        }
        self.records.insert(id, record);
    }

    /// Append a new task to the back of the pending queue.
    pub fn add(&mut self, task: Task) -> String {
        let id = task.id.clone();
        self.insert(TaskRecord::new(task));
        id
    }

    /// Whether `id` has a record.
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Whether `id` names a task or a superseded task the queue knows about.
    pub fn knows(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.superseded.contains_key(id)
    }

    /// Record for `id`.
    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    /// Whether `id` has completed.
    pub fn is_completed(&self, id: &str) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.status == TaskStatus::Completed)
    }

    /// Scan the pending queue and mark every task whose dependencies are all
    /// completed as `Ready`. Returns the ready ids in queue order.
    pub fn scan_ready(&mut self) -> Vec<String> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|id| {
                self.records
                    .get(id.as_str())
                    .is_some_and(|r| r.task.is_ready(|dep| self.is_completed(dep)))
            })
            .cloned()
            .collect();

        for id in &ready {
            if let Some(record) = self.records.get_mut(id) {
                record.status = TaskStatus::Ready;
            }
        }
        ready
    }

    /// Ready ids ordered for dispatch: recovery work first, then by priority,
    /// with queue order as the final tiebreak.
    pub fn dispatch_order(&mut self) -> Vec<String> {
        let mut ready = self.scan_ready();
        ready.sort_by_key(|id| {
            self.records
                .get(id)
                .map(|r| (!r.recovery, r.task.priority))
        });
        ready
    }

    /// Move a task from the pending queue into the active set.
    pub fn mark_active(&mut self, id: &str) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.status = TaskStatus::Active;
        record.started_at = Some(Utc::now());
        self.pending.retain(|p| p != id);
        self.active.push(id.to_string());
        true
    }

    /// Put a deferred task back to `Pending` without moving it in the queue.
    pub fn mark_deferred(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            if record.status == TaskStatus::Ready {
                record.status = TaskStatus::Pending;
            }
        }
    }

    /// Record a successful result. Returns false for an unknown id.
    pub fn mark_completed(&mut self, id: &str, output: TaskOutput) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.status = TaskStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.result = Some(output);
        record.failure = None;
        self.active.retain(|a| a != id);
        self.pending.retain(|p| p != id);
        self.completed.push(id.to_string());
        true
    }

    /// Record a terminal failure and block every pending task that
    /// (transitively) depends on it. Returns the blocked ids.
    pub fn mark_failed(&mut self, id: &str, reason: FailureReason) -> Vec<String> {
        if !self.fail_one(id, reason) {
            return Vec::new();
        }

        let mut blocked = Vec::new();
        let mut worklist = vec![id.to_string()];
        while let Some(failed_id) = worklist.pop() {
            let dependents: Vec<String> = self
                .pending
                .iter()
                .filter(|p| {
                    self.records
                        .get(p.as_str())
                        .is_some_and(|r| r.task.dependencies.contains(&failed_id))
                })
                .cloned()
                .collect();
            for dependent in dependents {
                self.fail_one(
                    &dependent,
                    FailureReason::DependencyFailed {
                        dependency: failed_id.clone(),
                    },
                );
                worklist.push(dependent.clone());
                blocked.push(dependent);
            }
        }
        blocked
    }

    fn fail_one(&mut self, id: &str, reason: FailureReason) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.status = TaskStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.failure = Some(reason.clone());
        self.active.retain(|a| a != id);
        self.pending.retain(|p| p != id);
        self.failed.push(FailedTask {
            task_id: id.to_string(),
            reason,
        });
        true
    }

    /// Ids of every known task that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut worklist = vec![id.to_string()];
        while let Some(current) = worklist.pop() {
            for record in self.records.values() {
                if record.task.dependencies.contains(&current)
                    && found.insert(record.task.id.clone())
                {
                    worklist.push(record.task.id.clone());
                }
            }
        }
        found
    }

    /// Send a task that failed back to the front of the pending queue.
    pub fn requeue_front(&mut self, id: &str) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.status = TaskStatus::Pending;
        record.started_at = None;
        record.recovery = true;
        self.active.retain(|a| a != id);
        self.pending.retain(|p| p != id);
        self.pending.push_front(id.to_string());
        true
    }

    /// Replace a failed task with recovery tasks, enqueued at the front in the
    /// given order.
    ///
    /// A replacement sharing the original id takes over its record. Otherwise
    /// the original is superseded and its dependents are rewired to wait for
    /// every replacement.
    pub fn replace(&mut self, original: &str, replacements: Vec<Task>) {
        let keeps_original = replacements.iter().any(|t| t.id == original);
        let new_ids: Vec<String> = replacements.iter().map(|t| t.id.clone()).collect();

        self.active.retain(|a| a != original);
        self.pending.retain(|p| p != original && !new_ids.contains(p));

        if !keeps_original {
            self.records.remove(original);
            for record in self.records.values_mut() {
                if record.task.dependencies.iter().any(|d| d == original) {
                    record.task.dependencies.retain(|d| d != original);
                    for id in &new_ids {
                        record.task.add_dependency(id.clone());
                    }
                }
            }
            self.superseded.insert(original.to_string(), new_ids.clone());
        }

        for task in replacements.into_iter().rev() {
            let id = task.id.clone();
            let mut record = TaskRecord::new(task);
            record.recovery = true;
            self.records.insert(id.clone(), record);
            self.pending.push_front(id);
        }
    }

    /// Fail every pending task with a reason chosen per record. Used when the
    /// run can make no further progress.
    pub fn abandon_pending<F>(&mut self, reason_for: F) -> Vec<String>
    where
        F: Fn(&TaskRecord) -> FailureReason,
    {
        let ids: Vec<String> = self.pending.iter().cloned().collect();
        for id in &ids {
            let reason = match self.records.get(id) {
                Some(record) => reason_for(record),
                None => continue,
            };
            self.fail_one(id, reason);
        }
        ids
    }

    /// Pending ids, front first.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Ids in flight.
    pub fn active_ids(&self) -> &[String] {
        &self.active
    }

    /// Completed ids in completion order.
    pub fn completed_ids(&self) -> &[String] {
        &self.completed
    }

    /// Tasks that ended without completing.
    pub fn failed(&self) -> &[FailedTask] {
        &self.failed
    }

    /// Original id -> ids of the tasks that replaced it.
    pub fn superseded(&self) -> &HashMap<String, Vec<String>> {
        &self.superseded
    }

    pub(crate) fn set_superseded(&mut self, superseded: HashMap<String, Vec<String>>) {
        self.superseded = superseded;
    }

    /// Every record in queue-relevant order: completed, active, pending, failed.
    pub fn records(&self) -> Vec<&TaskRecord> {
        self.completed
            .iter()
            .chain(self.active.iter())
            .chain(self.pending.iter())
            .chain(self.failed.iter().map(|f| &f.task_id))
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    /// Tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Tasks in flight.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Tasks completed.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Every task the queue has a record for.
    pub fn total_count(&self) -> usize {
        self.records.len()
    }

    /// Nothing pending and nothing in flight.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}
