use crate::config::PoolConfig;
use crate::types::{Task, TaskCategory, TaskOutput};
use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An executor for one category of work. Executes one task at a time.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Perform the task and report what it cost and which files it touched.
    ///
    /// Implementations bound their own duration; the scheduler never cancels
    /// an execution once started.
    async fn execute(&self, task: &Task) -> EnsembleResult<TaskOutput>;
}

/// Constructs a fresh worker for a category.
pub type WorkerConstructor =
    Arc<dyn Fn(TaskCategory) -> EnsembleResult<Box<dyn Worker>> + Send + Sync>;

/// Closed mapping from task category to worker constructor.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    constructors: HashMap<TaskCategory, WorkerConstructor>,
}

impl WorkerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for one category, replacing any previous one.
    pub fn register<F>(&mut self, category: TaskCategory, constructor: F)
    where
        F: Fn(TaskCategory) -> EnsembleResult<Box<dyn Worker>> + Send + Sync + 'static,
    {
        self.constructors.insert(category, Arc::new(constructor));
    }

    /// Register one constructor for every category.
    pub fn register_all<F>(&mut self, constructor: F)
    where
        F: Fn(TaskCategory) -> EnsembleResult<Box<dyn Worker>> + Send + Sync + 'static,
    {
        let constructor: WorkerConstructor = Arc::new(constructor);
        for category in TaskCategory::ALL {
            self.constructors.insert(category, Arc::clone(&constructor));
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, category: TaskCategory, constructor: F) -> Self
    where
        F: Fn(TaskCategory) -> EnsembleResult<Box<dyn Worker>> + Send + Sync + 'static,
    {
        self.register(category, constructor);
        self
    }

    /// Whether `category` has a constructor.
    pub fn contains(&self, category: TaskCategory) -> bool {
        self.constructors.contains_key(&category)
    }

    /// Registered categories, sorted.
    pub fn categories(&self) -> Vec<TaskCategory> {
        let mut categories: Vec<TaskCategory> = self.constructors.keys().copied().collect();
        categories.sort();
        categories
    }

    /// Construct a new worker for `category`.
    pub fn create(&self, category: TaskCategory) -> EnsembleResult<Box<dyn Worker>> {
        let constructor = self.constructors.get(&category).ok_or_else(|| {
            EnsembleError::Worker(format!("no worker registered for category '{category}'"))
        })?;
        constructor(category)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("categories", &self.categories())
            .finish()
    }
}

/// Lifecycle of a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Waiting in the pool for its next task.
    Idle,
    /// Leased to exactly one task.
    Busy,
}

/// Exclusive handle to a busy worker. Must be given back with
/// [`WorkerPool::release`] (or [`WorkerPool::discard`] if it was lost).
pub struct WorkerLease {
    id: Uuid,
    category: TaskCategory,
    worker: Box<dyn Worker>,
    acquired_at: Instant,
    reused: bool,
}

impl WorkerLease {
    /// Pool-assigned worker id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Category of the leased worker.
    pub fn category(&self) -> TaskCategory {
        self.category
    }

    /// Whether this worker served an earlier task.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Time since the lease was handed out.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Run `task` on the leased worker.
    pub async fn execute(&self, task: &Task) -> EnsembleResult<TaskOutput> {
        self.worker.execute(task).await
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("reused", &self.reused)
            .finish()
    }
}

struct IdleWorker {
    id: Uuid,
    worker: Box<dyn Worker>,
    released_at: Instant,
}

#[derive(Default)]
struct CategoryPool {
    idle: VecDeque<IdleWorker>,
    busy: HashSet<Uuid>,
    /// Slots reserved while a constructor runs outside the lock.
    creating: usize,
    created: u64,
    evicted: u64,
    discarded: u64,
}

impl CategoryPool {
    fn live(&self) -> usize {
        self.idle.len() + self.busy.len() + self.creating
    }

    fn evict_expired(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let before = self.idle.len();
        self.idle
            .retain(|w| now.saturating_duration_since(w.released_at) <= idle_timeout);
        let evicted = before - self.idle.len();
        self.evicted += evicted as u64;
        evicted
    }
}

/// Counters for one category's pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers waiting for a task.
    pub idle: usize,
    /// Workers currently leased.
    pub busy: usize,
    /// Workers ever constructed.
    pub created: u64,
    /// Idle workers evicted after the idle timeout.
    pub evicted: u64,
    /// Workers dropped after a failed or lost task.
    pub discarded: u64,
}

/// Bounded, per-category pools of reusable workers.
///
/// Each mutation holds the internal lock only for the bookkeeping itself;
/// constructors run outside it.
pub struct WorkerPool {
    config: PoolConfig,
    pools: Mutex<HashMap<TaskCategory, CategoryPool>>,
    released: Notify,
}

impl WorkerPool {
    /// An empty pool; workers are created on first acquire.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Pool sizing and timeouts.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take an idle worker of `category`, or create one with `factory` if the
    /// category is below its limit. Returns `Ok(None)` when the category is at
    /// capacity.
    pub fn try_acquire<F>(
        &self,
        category: TaskCategory,
        factory: F,
    ) -> EnsembleResult<Option<WorkerLease>>
    where
        F: FnOnce() -> EnsembleResult<Box<dyn Worker>>,
    {
        self.try_acquire_at(category, factory, Instant::now())
    }

    pub(crate) fn try_acquire_at<F>(
        &self,
        category: TaskCategory,
        factory: F,
        now: Instant,
    ) -> EnsembleResult<Option<WorkerLease>>
    where
        F: FnOnce() -> EnsembleResult<Box<dyn Worker>>,
    {
        {
            let mut pools = self.pools.lock();
            let pool = pools.entry(category).or_default();

            let evicted = pool.evict_expired(now, self.config.idle_timeout());
            if evicted > 0 {
                debug!(category = %category, evicted, "Evicted idle workers");
            }

            // Most recently released first, so older workers age out.
            if let Some(idle) = pool.idle.pop_back() {
                pool.busy.insert(idle.id);
                return Ok(Some(WorkerLease {
                    id: idle.id,
                    category,
                    worker: idle.worker,
                    acquired_at: now,
                    reused: true,
                }));
            }

            if pool.live() >= self.config.limit_for(category) {
                return Ok(None);
            }
            pool.creating += 1;
        }

        let created = factory();

        let mut pools = self.pools.lock();
        let pool = pools.entry(category).or_default();
        pool.creating -= 1;
        match created {
            Ok(worker) => {
                let id = Uuid::new_v4();
                pool.busy.insert(id);
                pool.created += 1;
                debug!(category = %category, worker_id = %id, "Created worker");
                Ok(Some(WorkerLease {
                    id,
                    category,
                    worker,
                    acquired_at: now,
                    reused: false,
                }))
            }
            Err(e) => {
                drop(pools);
                self.released.notify_waiters();
                Err(e)
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but waits for a release for up
    /// to the configured acquire timeout before failing with
    /// [`EnsembleError::PoolExhausted`].
    pub async fn acquire<F>(&self, category: TaskCategory, factory: F) -> EnsembleResult<WorkerLease>
    where
        F: Fn() -> EnsembleResult<Box<dyn Worker>>,
    {
        let timeout = self.config.acquire_timeout();
        let started = Instant::now();

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(category, &factory)? {
                return Ok(lease);
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(EnsembleError::PoolExhausted {
                    category: category.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Return a worker after its task finished. A worker whose task failed is
    /// treated as unhealthy and dropped instead of reused.
    pub fn release(&self, lease: WorkerLease, failed: bool) {
        self.release_at(lease, failed, Instant::now());
    }

    pub(crate) fn release_at(&self, lease: WorkerLease, failed: bool, now: Instant) {
        {
            let mut pools = self.pools.lock();
            let pool = pools.entry(lease.category).or_default();
            if !pool.busy.remove(&lease.id) {
                warn!(worker_id = %lease.id, category = %lease.category, "Released a worker the pool does not own");
                return;
            }
            if failed {
                pool.discarded += 1;
                debug!(worker_id = %lease.id, category = %lease.category, "Discarded failed worker");
            } else {
                pool.idle.push_back(IdleWorker {
                    id: lease.id,
                    worker: lease.worker,
                    released_at: now,
                });
            }
        }
        self.released.notify_waiters();
    }

    /// Forget a busy worker whose lease was lost (e.g. its task panicked).
    pub fn discard(&self, category: TaskCategory, worker_id: Uuid) {
        {
            let mut pools = self.pools.lock();
            if let Some(pool) = pools.get_mut(&category) {
                if pool.busy.remove(&worker_id) {
                    pool.discarded += 1;
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Where a worker currently is, or `None` if it left the pool.
    pub fn state_of(&self, category: TaskCategory, worker_id: Uuid) -> Option<WorkerState> {
        let pools = self.pools.lock();
        let pool = pools.get(&category)?;
        if pool.busy.contains(&worker_id) {
            Some(WorkerState::Busy)
        } else if pool.idle.iter().any(|w| w.id == worker_id) {
            Some(WorkerState::Idle)
        } else {
            None
        }
    }

    /// Evict every idle worker older than the idle timeout. Returns how many
    /// were evicted.
    pub fn reclaim_idle(&self) -> usize {
        self.reclaim_idle_at(Instant::now())
    }

    pub(crate) fn reclaim_idle_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let evicted: usize = self
            .pools
            .lock()
            .values_mut()
            .map(|pool| pool.evict_expired(now, idle_timeout))
            .sum();
        if evicted > 0 {
            self.released.notify_waiters();
        }
        evicted
    }

    /// Run [`reclaim_idle`](Self::reclaim_idle) every `interval` until the
    /// pool is dropped or the handle is aborted.
    pub fn spawn_reclaimer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let evicted = pool.reclaim_idle();
                if evicted > 0 {
                    debug!(evicted, "Idle reclamation pass");
                }
            }
        })
    }

    /// Counters for one category.
    pub fn stats(&self, category: TaskCategory) -> PoolStats {
        self.pools
            .lock()
            .get(&category)
            .map(CategoryPool::stats)
            .unwrap_or_default()
    }

    /// Counters for every category that has been used.
    pub fn all_stats(&self) -> BTreeMap<TaskCategory, PoolStats> {
        self.pools
            .lock()
            .iter()
            .map(|(category, pool)| (*category, pool.stats()))
            .collect()
    }

    /// Busy workers across every category.
    pub fn busy_count(&self) -> usize {
        self.pools.lock().values().map(|p| p.busy.len()).sum()
    }
}

impl CategoryPool {
    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            busy: self.busy.len(),
            created: self.created,
            evicted: self.evicted,
            discarded: self.discarded,
        }
    }
}
