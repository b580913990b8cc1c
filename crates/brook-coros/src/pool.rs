//! Coprocedure pools: queued jobs served by a fixed set of worker coroutines
//!
//! A pool owns a bounded FIFO of jobs and `size` worker coroutines. Idle
//! workers park on the pool's wakeup pump; `enqueue` pushes the job and
//! posts one wakeup, so exactly one parked worker picks it up, in the same
//! call stack when one is idle. Busy workers drain the queue before parking
//! again, so jobs queued while every worker was occupied still run.
//!
//! Closing a pool stops intake, lets running jobs finish, drains the
//! backlog, and retires the workers. Each pool also watches the app status
//! pump and closes itself when a posted status is not `"running"`.

use brook_events::{ListenerGuard, Pump};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coro::Coro;
use crate::error::EventError;
use crate::runtime::Runtime;

/// Worker count for pools without a specific size entry
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Queue bound for pools without a settings override
pub const DEFAULT_QUEUE_SIZE: usize = 4096;

/// Pump carrying application status events; any status other than
/// `"running"` closes every initialized pool
pub const APP_STATUS_PUMP: &str = "app";

/// Pools that deliberately serialize their jobs
static DEFAULT_POOL_SIZES: Lazy<FxHashMap<&'static str, usize>> = Lazy::new(|| {
    let mut sizes = FxHashMap::default();
    sizes.insert("Upload", 1);
    sizes.insert("AIS", 1);
    sizes
});

/// Pool bookkeeping errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Enqueue on a pool that was closed
    #[error("pool {0} is closed")]
    Closed(String),

    /// Enqueue would exceed the pool's queue bound
    #[error("pool {pool} queue is full ({limit} jobs)")]
    QueueFull {
        /// Pool name
        pool: String,
        /// The configured queue bound
        limit: usize,
    },
}

/// Sizing overrides, deserializable from application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Worker count for pools not named in `sizes`
    pub default_size: usize,
    /// Maximum queued (not yet started) jobs per pool
    pub queue_limit: usize,
    /// Per-pool worker counts, overriding the built-in table
    pub sizes: FxHashMap<String, usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_POOL_SIZE,
            queue_limit: DEFAULT_QUEUE_SIZE,
            sizes: FxHashMap::default(),
        }
    }
}

impl PoolSettings {
    /// Worker count for `name`: explicit override, then the built-in
    /// table, then the default
    pub fn size_for(&self, name: &str) -> usize {
        if let Some(&size) = self.sizes.get(name) {
            return size;
        }
        if let Some(&size) = DEFAULT_POOL_SIZES.get(name) {
            return size;
        }
        self.default_size
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one enqueued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    fn new() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

type JobFuture = Pin<Box<dyn Future<Output = Result<(), EventError>>>>;
type BoxedJob = Box<dyn FnOnce(Coro) -> JobFuture>;

struct QueuedJob {
    id: JobId,
    label: String,
    job: BoxedJob,
}

/// State shared between the pool handle, its workers, and the status
/// listener
struct PoolShared {
    name: String,
    queue_limit: usize,
    queue: RefCell<VecDeque<QueuedJob>>,
    closed: Cell<bool>,
    /// Jobs currently being run by workers
    active: Cell<usize>,
    /// Idle workers park here; one post wakes one worker
    wakeup: Pump,
}

impl PoolShared {
    fn pop(&self) -> Option<QueuedJob> {
        self.queue.borrow_mut().pop_front()
    }

    /// Stop intake and retire the parked workers. Busy workers drain the
    /// backlog and retire once their current job finishes.
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        info!(
            pool = %self.name,
            pending = self.queue.borrow().len(),
            "closing coprocedure pool"
        );
        // One post retires one parked worker; a retiring worker drains the
        // queue first, so the backlog still runs.
        while self.wakeup.listener_count() > 0 {
            self.wakeup.post(&Value::Null);
        }
    }
}

async fn worker_loop(co: Coro, shared: Rc<PoolShared>) -> Result<(), EventError> {
    loop {
        while let Some(next) = shared.pop() {
            debug!(
                pool = %shared.name,
                job = %next.id,
                label = %next.label,
                worker = %co.name(),
                "running job"
            );
            shared.active.set(shared.active.get() + 1);
            let result = (next.job)(co.clone()).await;
            shared.active.set(shared.active.get() - 1);
            // A failing job must not take its worker down with it
            if let Err(err) = result {
                warn!(
                    pool = %shared.name,
                    job = %next.id,
                    label = %next.label,
                    error = %err,
                    "job failed"
                );
            }
        }
        if shared.closed.get() {
            break;
        }
        co.suspend_until_event_on(&shared.wakeup).await;
    }
    debug!(pool = %shared.name, worker = %co.name(), "worker retiring");
    Ok(())
}

/// One named pool of worker coroutines over a bounded job queue
pub struct CoroPool {
    shared: Rc<PoolShared>,
    size: usize,
    pumps: brook_events::Pumps,
    _status: ListenerGuard,
}

impl CoroPool {
    fn new(rt: &Runtime, name: &str, size: usize, queue_limit: usize) -> Self {
        let shared = Rc::new(PoolShared {
            name: name.to_string(),
            queue_limit,
            queue: RefCell::new(VecDeque::new()),
            closed: Cell::new(false),
            active: Cell::new(0),
            wakeup: rt.pumps().make(&format!("{name}-pool-wakeup")),
        });

        let watcher = shared.clone();
        let status = rt
            .obtain(APP_STATUS_PUMP)
            .listen_guarded(format!("{name}-pool-status"), move |status: &Value| {
                if status["status"].as_str() != Some("running") {
                    info!(pool = %watcher.name, "app is no longer running");
                    watcher.close();
                }
                false
            })
            .expect("one status listener per pool name");

        info!(pool = %name, size, queue_limit, "initialized coprocedure pool");
        for _ in 0..size {
            let shared = shared.clone();
            rt.launch(&format!("{name}-pool-worker"), move |co| {
                worker_loop(co, shared)
            });
        }

        Self {
            shared,
            size,
            pumps: rt.pumps().clone(),
            _status: status,
        }
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of worker coroutines
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued but not yet started
    pub fn count_pending(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Jobs currently running on a worker
    pub fn count_active(&self) -> usize {
        self.shared.active.get()
    }

    /// True once the pool stopped accepting jobs
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Queue a job. An idle worker starts it inside this call; otherwise it
    /// waits its turn in FIFO order.
    pub fn enqueue<F, Fut>(&self, label: &str, job: F) -> Result<JobId, PoolError>
    where
        F: FnOnce(Coro) -> Fut + 'static,
        Fut: Future<Output = Result<(), EventError>> + 'static,
    {
        self.enqueue_boxed(label, Box::new(move |co| -> JobFuture { Box::pin(job(co)) }))
    }

    fn enqueue_boxed(&self, label: &str, job: BoxedJob) -> Result<JobId, PoolError> {
        let shared = &self.shared;
        if shared.closed.get() {
            return Err(PoolError::Closed(shared.name.clone()));
        }
        let id = JobId::new();
        {
            let mut queue = shared.queue.borrow_mut();
            if queue.len() >= shared.queue_limit {
                return Err(PoolError::QueueFull {
                    pool: shared.name.clone(),
                    limit: shared.queue_limit,
                });
            }
            queue.push_back(QueuedJob {
                id,
                label: label.to_string(),
                job,
            });
        }
        debug!(pool = %shared.name, job = %id, label = %label, "job queued");
        // Wakes at most one parked worker; a fully busy pool leaves the
        // job queued until a worker frees up.
        shared.wakeup.post(&Value::Null);
        Ok(id)
    }

    /// Stop intake; running jobs finish, the backlog drains, workers retire
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for CoroPool {
    fn drop(&mut self) {
        self.shared.close();
        self.pumps.remove(self.shared.wakeup.name());
    }
}

impl fmt::Debug for CoroPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("pending", &self.count_pending())
            .field("active", &self.count_active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Managed set of named pools over one runtime.
///
/// Pools are created on first use with sizes from [`PoolSettings`].
pub struct CoroPools {
    rt: Runtime,
    settings: PoolSettings,
    pools: RefCell<FxHashMap<String, Rc<CoroPool>>>,
}

impl CoroPools {
    /// Create a pool manager with default settings
    pub fn new(rt: &Runtime) -> Self {
        Self::with_settings(rt, PoolSettings::default())
    }

    /// Create a pool manager with explicit sizing
    pub fn with_settings(rt: &Runtime, settings: PoolSettings) -> Self {
        Self {
            rt: rt.clone(),
            settings,
            pools: RefCell::new(FxHashMap::default()),
        }
    }

    fn pool(&self, name: &str) -> Rc<CoroPool> {
        if let Some(pool) = self.pools.borrow().get(name) {
            return pool.clone();
        }
        let size = self.settings.size_for(name);
        let pool = Rc::new(CoroPool::new(&self.rt, name, size, self.settings.queue_limit));
        self.pools
            .borrow_mut()
            .insert(name.to_string(), pool.clone());
        pool
    }

    /// Create the named pool up front (idempotent). Pools not initialized
    /// explicitly are created by the first enqueue.
    pub fn initialize_pool(&self, name: &str) {
        self.pool(name);
    }

    /// Queue a job on the named pool, creating the pool if needed
    pub fn enqueue<F, Fut>(&self, pool: &str, label: &str, job: F) -> Result<JobId, PoolError>
    where
        F: FnOnce(Coro) -> Fut + 'static,
        Fut: Future<Output = Result<(), EventError>> + 'static,
    {
        self.pool(pool).enqueue(label, job)
    }

    /// Queued jobs across all pools
    pub fn count_pending(&self) -> usize {
        self.pools
            .borrow()
            .values()
            .map(|pool| pool.count_pending())
            .sum()
    }

    /// Queued jobs in one pool (0 if the pool does not exist)
    pub fn count_pending_in(&self, name: &str) -> usize {
        self.pools
            .borrow()
            .get(name)
            .map_or(0, |pool| pool.count_pending())
    }

    /// Running jobs across all pools
    pub fn count_active(&self) -> usize {
        self.pools
            .borrow()
            .values()
            .map(|pool| pool.count_active())
            .sum()
    }

    /// Running jobs in one pool (0 if the pool does not exist)
    pub fn count_active_in(&self, name: &str) -> usize {
        self.pools
            .borrow()
            .get(name)
            .map_or(0, |pool| pool.count_active())
    }

    /// Queued plus running jobs across all pools
    pub fn count(&self) -> usize {
        self.count_pending() + self.count_active()
    }

    /// Close one pool; it keeps refusing jobs afterwards
    pub fn close(&self, name: &str) {
        let pool = self.pools.borrow().get(name).cloned();
        if let Some(pool) = pool {
            pool.close();
        }
    }

    /// Close every pool
    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.borrow().values().cloned().collect();
        for pool in pools {
            pool.close();
        }
    }
}
