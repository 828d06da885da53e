use crate::types::{Task, TaskRecord};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Separator between a feature name and a task id in merged plans.
pub const FEATURE_SEPARATOR: char = ':';

/// Metadata key that assigns a task of a flat plan to a feature.
pub const FEATURE_METADATA_KEY: &str = "feature";

/// Tasks planned independently for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePlan {
    /// Feature name; becomes the id prefix.
    pub name: String,
    /// Tasks with feature-local ids.
    pub tasks: Vec<Task>,
}

impl FeaturePlan {
    /// A feature plan from its name and tasks.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }
}

/// "`target_feature` may only start after `source_feature` has finished."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConstraint {
    /// Feature that has to finish first.
    #[serde(alias = "sourceFeature", alias = "source")]
    pub source_feature: String,
    /// Feature that waits for it.
    #[serde(alias = "targetFeature", alias = "target")]
    pub target_feature: String,
}

impl FeatureConstraint {
    /// `target` starts only after `source` finished.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_feature: source.into(),
            target_feature: target.into(),
        }
    }
}

/// Planning input: a flat task list, per-feature sub-plans, and ordering constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Tasks with globally unique ids.
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Independently planned features, merged with prefixed ids.
    #[serde(default)]
    pub features: Vec<FeaturePlan>,
    /// Ordering constraints between features.
    #[serde(default)]
    pub constraints: Vec<FeatureConstraint>,
}

impl Plan {
    /// A plan made of already globally-unique tasks.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    /// Merge independently planned features; ids get prefixed with their feature name.
    pub fn merge(features: Vec<FeaturePlan>, constraints: Vec<FeatureConstraint>) -> Self {
        Self {
            tasks: Vec::new(),
            features,
            constraints,
        }
    }

    /// Add a feature ordering constraint.
    pub fn with_constraint(mut self, constraint: FeatureConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Total number of tasks across the flat list and every feature.
    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.features.iter().map(|f| f.tasks.len()).sum::<usize>()
    }

    /// Flatten into globally unique tasks with feature constraints materialized
    /// as dependency edges.
    pub fn flatten(&self) -> EnsembleResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(self.task_count());
        // feature name -> ids in input order
        let mut members: HashMap<String, Vec<String>> = HashMap::new();

        for task in &self.tasks {
            if let Some(feature) = task
                .metadata
                .get(FEATURE_METADATA_KEY)
                .and_then(|v| v.as_str())
            {
                members
                    .entry(feature.to_string())
                    .or_default()
                    .push(task.id.clone());
            }
            tasks.push(task.clone());
        }

        for feature in &self.features {
            if feature.name.is_empty() || feature.name.contains(FEATURE_SEPARATOR) {
                return Err(EnsembleError::Planning(format!(
                    "invalid feature name '{}'",
                    feature.name
                )));
            }
            let local: HashSet<&str> = feature.tasks.iter().map(|t| t.id.as_str()).collect();
            let ids = members.entry(feature.name.clone()).or_default();
            for task in &feature.tasks {
                let mut merged = task.clone();
                merged.id = prefixed(&feature.name, &task.id);
                merged.dependencies = task
                    .dependencies
                    .iter()
                    .map(|dep| {
                        if local.contains(dep.as_str()) {
                            prefixed(&feature.name, dep)
                        } else {
                            dep.clone()
                        }
                    })
                    .collect();
                merged.metadata.insert(
                    FEATURE_METADATA_KEY.to_string(),
                    serde_json::Value::String(feature.name.clone()),
                );
                ids.push(merged.id.clone());
                tasks.push(merged);
            }
        }

        for constraint in &self.constraints {
            if constraint.source_feature == constraint.target_feature {
                return Err(EnsembleError::Planning(format!(
                    "feature '{}' cannot be ordered after itself",
                    constraint.source_feature
                )));
            }
            let source_last = members
                .get(&constraint.source_feature)
                .ok_or_else(|| unknown_feature(&constraint.source_feature))?
                .last()
                .cloned();
            let target_first = members
                .get(&constraint.target_feature)
                .ok_or_else(|| unknown_feature(&constraint.target_feature))?
                .first()
                .cloned();

            let (Some(source_last), Some(target_first)) = (source_last, target_first) else {
                debug!(
                    source = %constraint.source_feature,
                    target = %constraint.target_feature,
                    "Skipping constraint on empty feature"
                );
                continue;
            };

            if let Some(task) = tasks.iter_mut().find(|t| t.id == target_first) {
                task.add_dependency(source_last);
            }
        }

        Ok(tasks)
    }
}

fn prefixed(feature: &str, id: &str) -> String {
    format!("{feature}{FEATURE_SEPARATOR}{id}")
}

fn unknown_feature(name: &str) -> EnsembleError {
    EnsembleError::Planning(format!("constraint references unknown feature '{name}'"))
}

/// Dependency graph of one planning pass, with its linear execution order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph for a plan.
    ///
    /// Fails with [`EnsembleError::Planning`] on duplicate or empty ids, invalid
    /// estimates, unknown dependencies, or cycles.
    pub fn build(plan: &Plan) -> EnsembleResult<Self> {
        let tasks = plan.flatten()?;
        let graph = Self::from_tasks(tasks)?;
        info!(
            tasks = graph.len(),
            constraints = plan.constraints.len(),
            "Dependency graph built"
        );
        Ok(graph)
    }

    /// Build the graph from tasks whose ids are already globally unique.
    pub fn from_tasks(tasks: Vec<Task>) -> EnsembleResult<Self> {
        let index = index_tasks(&tasks)?;
        let order = dfs_order(&tasks, &index, |_| false)?;
        Ok(Self {
            tasks,
            index,
            order,
        })
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether `id` is a task of this graph.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Dependency ids of a task, including synthetic feature edges.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.get(id).map(|t| t.dependencies.as_slice()).unwrap_or(&[])
    }

    /// Ids of tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// The mapping from each task id to its dependency ids.
    pub fn edges(&self) -> HashMap<&str, &[String]> {
        self.tasks
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
            .collect()
    }

    /// Task ids in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.tasks[i].id.as_str()).collect()
    }

    /// Consume the graph into pending records in execution order.
    pub fn into_records(self) -> Vec<TaskRecord> {
        let mut slots: Vec<Option<Task>> = self.tasks.into_iter().map(Some).collect();
        self.order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .map(TaskRecord::new)
            .collect()
    }
}

/// Order a batch of tasks produced after planning (e.g. by recovery).
///
/// Dependencies must either point inside the batch or satisfy `is_known`.
pub fn order_extension<F>(tasks: Vec<Task>, is_known: F) -> EnsembleResult<Vec<Task>>
where
    F: Fn(&str) -> bool,
{
    let index = index_tasks(&tasks)?;
    let order = dfs_order(&tasks, &index, is_known)?;
    let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn index_tasks(tasks: &[Task]) -> EnsembleResult<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if task.id.is_empty() {
            return Err(EnsembleError::Planning(format!(
                "task '{}' has an empty id",
                task.name
            )));
        }
        if !task.estimated_cost.is_finite() || task.estimated_cost < 0.0 {
            return Err(EnsembleError::Planning(format!(
                "task '{}' has invalid estimated cost {}",
                task.id, task.estimated_cost
            )));
        }
        if index.insert(task.id.clone(), i).is_some() {
            return Err(EnsembleError::Planning(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
    }
    Ok(index)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first topological order: a node is emitted only after all of its
/// dependencies. Roots and siblings are visited by (priority, input position).
fn dfs_order<F>(
    tasks: &[Task],
    index: &HashMap<String, usize>,
    is_external: F,
) -> EnsembleResult<Vec<usize>>
where
    F: Fn(&str) -> bool,
{
    let rank = |i: usize| (tasks[i].priority, i);

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut edges = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            match index.get(dep) {
                Some(&j) => {
                    if !edges.contains(&j) {
                        edges.push(j);
                    }
                }
                None if is_external(dep) => {}
                None => {
                    return Err(EnsembleError::Planning(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.id
                    )));
                }
            }
        }
        edges.sort_by_key(|&j| rank(j));
        deps.push(edges);
    }

    let mut roots: Vec<usize> = (0..tasks.len()).collect();
    roots.sort_by_key(|&i| rank(i));

    let mut marks = vec![Mark::Unvisited; tasks.len()];
    let mut order = Vec::with_capacity(tasks.len());
    // (node, index of the next dependency to visit)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in roots {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        stack.push((root, 0));

        while let Some(&(node, next)) = stack.last() {
            let Some(&dep) = deps[node].get(next) else {
                marks[node] = Mark::Done;
                order.push(node);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match marks[dep] {
                Mark::Unvisited => {
                    marks[dep] = Mark::InProgress;
                    stack.push((dep, 0));
                }
                Mark::InProgress => {
                    let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let cycle: Vec<&str> = stack[start..]
                        .iter()
                        .map(|&(n, _)| tasks[n].id.as_str())
                        .chain(std::iter::once(tasks[dep].id.as_str()))
                        .collect();
                    return Err(EnsembleError::Planning(format!(
                        "dependency cycle detected: {}",
                        cycle.join(" -> ")
                    )));
                }
                Mark::Done => {}
            }
        }
    }

    Ok(order)
}
