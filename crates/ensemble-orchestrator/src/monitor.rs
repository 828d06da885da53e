use crate::types::{CategoryMetrics, TaskCategory};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Live view of one worker category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryState {
    /// Category being tracked.
    pub category: TaskCategory,
    /// Tasks currently running on workers of this category.
    pub active_tasks: Vec<String>,
    /// Counters since the monitor was created.
    pub metrics: CategoryMetrics,
}

/// Tracks in-flight work and metrics per worker category.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct WorkerMonitor {
    states: Arc<RwLock<HashMap<TaskCategory, CategoryState>>>,
}

impl WorkerMonitor {
    /// A monitor with an empty entry for every category.
    pub fn new() -> Self {
        let states = TaskCategory::ALL
            .into_iter()
            .map(|category| {
                (
                    category,
                    CategoryState {
                        category,
                        active_tasks: Vec::new(),
                        metrics: CategoryMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Record a dispatch.
    pub async fn start_task(&self, category: TaskCategory, task_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&category) {
            state.active_tasks.push(task_id.to_string());
            state.metrics.dispatched += 1;
        }
    }

    /// Record a finished execution, successful or not.
    pub async fn finish_task(
        &self,
        category: TaskCategory,
        task_id: &str,
        succeeded: bool,
        cost: f64,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&category) {
            state.active_tasks.retain(|t| t != task_id);
            if succeeded {
                state.metrics.completed += 1;
            } else {
                state.metrics.failed += 1;
            }
            state.metrics.total_cost += cost;
            state.metrics.duration_ms += duration_ms;
        }
    }

    /// State of every category, sorted by category.
    pub async fn snapshot(&self) -> Vec<CategoryState> {
        let states = self.states.read().await;
        let mut snapshot: Vec<CategoryState> = states.values().cloned().collect();
        snapshot.sort_by_key(|s| s.category);
        snapshot
    }

    /// State of one category.
    pub async fn get_state(&self, category: TaskCategory) -> Option<CategoryState> {
        self.states.read().await.get(&category).cloned()
    }

    /// Sum of every category's metrics.
    pub async fn aggregate_metrics(&self) -> CategoryMetrics {
        let states = self.states.read().await;
        let mut total = CategoryMetrics::default();
        for state in states.values() {
            total.dispatched += state.metrics.dispatched;
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.total_cost += state.metrics.total_cost;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Number of tasks in flight across all categories.
    pub async fn active_count(&self) -> usize {
        self.states
            .read()
            .await
            .values()
            .map(|s| s.active_tasks.len())
            .sum()
    }

    /// Serialize the current state as JSON for dashboards and the CLI.
    pub async fn to_json(&self) -> serde_json::Value {
        let categories = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "categories": categories,
            "aggregate": aggregate,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
