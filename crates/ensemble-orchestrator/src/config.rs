use crate::types::TaskCategory;
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level engine configuration, usually loaded from the `[orchestrator]`
/// table of `ensemble.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ceiling on tasks in flight at once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// `[budget]` table.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// `[recovery]` table.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// `[pool]` table.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Events buffered per subscriber before the slowest one starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Shared cost ceiling for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total cost the run may commit.
    #[serde(default = "default_total_budget")]
    pub total: f64,
    /// Fraction of the total below which a budget warning is raised.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

/// Circuit breaker limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Failures after which a task's breaker opens.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A breaker record with no failure for this long is forgotten.
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,
}

/// Worker pool sizing and reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Live worker limit for categories without an override.
    #[serde(default = "default_max_workers_per_category")]
    pub max_workers_per_category: usize,
    /// Per-category overrides of `max_workers_per_category`, keyed by category name.
    #[serde(default)]
    pub category_limits: HashMap<String, usize>,
    /// Idle workers older than this are evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Wait threshold for a blocking acquire.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Period of the background reclamation pass.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_event_capacity() -> usize {
    1024
}

fn default_total_budget() -> f64 {
    10.0
}

fn default_warning_threshold() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_reset_window_secs() -> u64 {
    300
}

fn default_max_workers_per_category() -> usize {
    2
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_reclaim_interval_secs() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            budget: BudgetConfig::default(),
            recovery: RecoveryConfig::default(),
            pool: PoolConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total: default_total_budget(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            reset_window_secs: default_reset_window_secs(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_category: default_max_workers_per_category(),
            category_limits: HashMap::new(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> EnsembleResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| EnsembleError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Override the concurrency ceiling.
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    /// Override the total budget.
    pub fn with_budget(mut self, total: f64) -> Self {
        self.budget.total = total;
        self
    }

    /// Override the circuit breaker ceiling.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.recovery.max_attempts = n;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EnsembleError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if !self.budget.total.is_finite() || self.budget.total < 0.0 {
            return Err(EnsembleError::Config(format!(
                "budget.total must be a non-negative number, got {}",
                self.budget.total
            )));
        }
        if !(self.budget.warning_threshold > 0.0 && self.budget.warning_threshold <= 1.0) {
            return Err(EnsembleError::Config(format!(
                "budget.warning_threshold must be in (0, 1], got {}",
                self.budget.warning_threshold
            )));
        }
        if self.event_capacity == 0 {
            return Err(EnsembleError::Config(
                "event_capacity must be at least 1".into(),
            ));
        }
        if self.recovery.max_attempts == 0 {
            return Err(EnsembleError::Config(
                "recovery.max_attempts must be at least 1".into(),
            ));
        }
        self.pool.validate()
    }
}

impl RecoveryConfig {
    /// Quiet period after which a task's breaker record is forgotten.
    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }
}

impl PoolConfig {
    /// Reject zero limits and unknown category names.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.max_workers_per_category == 0 {
            return Err(EnsembleError::Config(
                "pool.max_workers_per_category must be at least 1".into(),
            ));
        }
        for (name, &limit) in &self.category_limits {
            name.parse::<TaskCategory>()?;
            if limit == 0 {
                return Err(EnsembleError::Config(format!(
                    "pool.category_limits.{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Maximum live workers (idle + busy) for a category.
    pub fn limit_for(&self, category: TaskCategory) -> usize {
        self.category_limits
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(category.as_str()))
            .map(|(_, &limit)| limit)
            .unwrap_or(self.max_workers_per_category)
    }

    /// How long an idle worker may wait before eviction.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// How long a blocking acquire waits for a slot.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Period of the background reclamation pass (at least one second).
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.budget.warning_threshold, 0.2);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.pool.limit_for(TaskCategory::Backend), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_concurrent_tasks = 5

            [budget]
            total = 2.5

            [pool.category_limits]
            frontend = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.budget.total, 2.5);
        assert_eq!(config.budget.warning_threshold, 0.2);
        assert_eq!(config.pool.limit_for(TaskCategory::Frontend), 4);
        assert_eq!(config.pool.limit_for(TaskCategory::Docs), 2);
        assert_eq!(config.recovery.reset_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_validation_errors() {
        assert!(OrchestratorConfig::default()
            .with_max_concurrent_tasks(0)
            .validate()
            .is_err());
        assert!(OrchestratorConfig::default()
            .with_budget(-1.0)
            .validate()
            .is_err());
        assert!(OrchestratorConfig::default()
            .with_max_attempts(0)
            .validate()
            .is_err());

        let err = OrchestratorConfig::from_toml_str("[pool.category_limits]\nquantum = 1\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown task category"));

        let err = OrchestratorConfig::from_toml_str("[pool.category_limits]\ndocs = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("category_limits.docs"));

        assert!(OrchestratorConfig::default()
            .with_budget(f64::NAN)
            .validate()
            .is_err());

        let err = OrchestratorConfig::from_toml_str("[budget]\nwarning_threshold = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("warning_threshold"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = OrchestratorConfig::from_toml_str("max_concurrent_tasks = ").unwrap_err();
        assert!(matches!(err, EnsembleError::Config(_)));
    }
}
