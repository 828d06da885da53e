use crate::task_queue::TaskQueue;
use crate::types::{FailedTask, TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Minimal record of a run, enough to resume it without re-planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Format version; see [`SNAPSHOT_VERSION`].
    pub version: u32,
    /// When the snapshot was captured.
    pub taken_at: DateTime<Utc>,
    /// Every known task record.
    pub records: Vec<TaskRecord>,
    /// Pending queue, front first.
    pub pending: Vec<String>,
    /// Tasks in flight when the snapshot was taken.
    pub active: Vec<String>,
    /// Completed ids in completion order.
    pub completed: Vec<String>,
    /// Tasks that ended without completing.
    pub failed: Vec<FailedTask>,
    /// Original id -> ids of the tasks that replaced it.
    #[serde(default)]
    pub superseded: BTreeMap<String, Vec<String>>,
    /// Breaker failure counts by task id.
    #[serde(default)]
    pub breaker_attempts: BTreeMap<String, u32>,
    /// Committed spend at capture time.
    #[serde(default)]
    pub committed_budget: f64,
}

impl SchedulerSnapshot {
    pub(crate) fn capture(
        queue: &TaskQueue,
        breaker_attempts: BTreeMap<String, u32>,
        committed_budget: f64,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            records: queue.records().into_iter().cloned().collect(),
            pending: queue.pending_ids(),
            active: queue.active_ids().to_vec(),
            completed: queue.completed_ids().to_vec(),
            failed: queue.failed().to_vec(),
            superseded: queue
                .superseded()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            breaker_attempts,
            committed_budget,
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> EnsembleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate.
    pub fn from_json(json: &str) -> EnsembleResult<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Write as JSON to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> EnsembleResult<()> {
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }

    /// Read and validate from `path`.
    pub async fn load(path: impl AsRef<Path>) -> EnsembleResult<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Whether the snapshot has work left to do.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    /// Check that every referenced id has a record and no id appears in two
    /// lists.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(EnsembleError::Snapshot(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                self.version
            )));
        }

        let known: HashSet<&str> = self.records.iter().map(|r| r.id()).collect();
        if known.len() != self.records.len() {
            return Err(EnsembleError::Snapshot("duplicate task record".into()));
        }

        let mut seen = HashSet::new();
        let listed = self
            .active
            .iter()
            .chain(self.pending.iter())
            .chain(self.completed.iter())
            .chain(self.failed.iter().map(|f| &f.task_id));
        for id in listed {
            if !known.contains(id.as_str()) {
                return Err(EnsembleError::Snapshot(format!(
                    "task '{id}' is listed but has no record"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(EnsembleError::Snapshot(format!(
                    "task '{id}' is listed more than once"
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the task queue. Tasks that were in flight go to the front of
    /// the pending queue, flagged as recovery work.
    pub(crate) fn to_queue(&self) -> EnsembleResult<TaskQueue> {
        self.validate()?;
        let mut by_id: HashMap<&str, &TaskRecord> =
            self.records.iter().map(|r| (r.id(), r)).collect();

        let mut ordered = Vec::with_capacity(self.records.len());
        for id in &self.active {
            if let Some(record) = by_id.remove(id.as_str()) {
                let mut record = record.clone();
                record.status = TaskStatus::Pending;
                record.recovery = true;
                ordered.push(record);
            }
        }
        for id in self.pending.iter().chain(self.completed.iter()) {
            if let Some(record) = by_id.remove(id.as_str()) {
                ordered.push(record.clone());
            }
        }
        for failed in &self.failed {
            if let Some(record) = by_id.remove(failed.task_id.as_str()) {
                let mut record = record.clone();
                record.status = TaskStatus::Failed;
                record.failure = Some(failed.reason.clone());
                ordered.push(record);
            }
        }

        let mut queue = TaskQueue::from_records(ordered);
        queue.set_superseded(
            self.superseded
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        Ok(queue)
    }
}
