#![forbid(unsafe_code)]

//! Worker pool and the scatter/gather protocol every operator is built on.
//!
//! A call partitions `[0, n)` into one [`Block`] per worker, enqueues one task
//! per block and then blocks the calling thread on each block's one-shot
//! result slot, in block order. Workers never wait on each other and never
//! see the caller's result; they hand back owned partials.

use std::ops::Range;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Environment variable that overrides the default worker count.
pub const WORKERS_ENV: &str = "BLOCKFRAME_WORKERS";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("worker pool needs at least one worker")]
    ZeroWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    #[error("block {block} produced no result (task panicked or was dropped)")]
    WorkerLost { block: usize },
}

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads, fixed for the pool's lifetime.
    pub workers: usize,
    /// Prefix for worker thread names; the worker id is appended.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            thread_name: "bf-worker".to_owned(),
        }
    }
}

impl PoolConfig {
    /// Default config, with the worker count taken from `BLOCKFRAME_WORKERS`
    /// when it holds a positive integer.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(WORKERS_ENV).ok().as_deref())
    }

    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        let config = Self::default();
        match value.and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(workers) if workers > 0 => config.with_workers(workers),
            _ => config,
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

// ── Worker pool ────────────────────────────────────────────────────────

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of threads draining one shared task queue.
///
/// Dropping the pool closes the queue, lets queued tasks finish and joins
/// every worker.
pub struct WorkerPool {
    queue: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, RuntimeError> {
        if config.workers == 0 {
            return Err(RuntimeError::ZeroWorkers);
        }

        let (queue, tasks) = crossbeam_channel::unbounded::<Task>();
        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let tasks = tasks.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{id}", config.thread_name))
                .spawn(move || worker_loop(id, &tasks))?;
            handles.push(handle);
        }

        debug!(workers = config.workers, "worker pool started");
        Ok(Self {
            queue: Some(queue),
            handles,
        })
    }

    pub fn with_workers(workers: usize) -> Result<Self, RuntimeError> {
        Self::new(PoolConfig::default().with_workers(workers))
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Queue a task for the next free worker.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let Some(queue) = &self.queue else {
            return;
        };
        // Fails only once every worker is gone; dropping the task then
        // drops any result slot it owns, which the gatherer observes.
        if queue.send(Box::new(task)).is_err() {
            warn!("task dropped: worker queue is closed");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread exited with a panic");
            }
        }
        debug!("worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

fn worker_loop(id: usize, tasks: &Receiver<Task>) {
    for task in tasks {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!(worker = id, "task panicked");
        }
    }
}

// ── Partitioning ───────────────────────────────────────────────────────

/// Half-open row range `[start, end)` handled by one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub id: usize,
    pub start: usize,
    pub end: usize,
}

impl Block {
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Split `[0, rows)` into exactly `workers` contiguous, disjoint blocks.
///
/// `block_size = ceil(rows / workers)`; trailing blocks are empty when
/// `rows < workers`. A worker count of zero is treated as one.
#[must_use]
pub fn partition(rows: usize, workers: usize) -> Vec<Block> {
    let workers = workers.max(1);
    let block_size = rows.div_ceil(workers);
    (0..workers)
        .map(|id| {
            let start = id.saturating_mul(block_size).min(rows);
            let end = start.saturating_add(block_size).min(rows);
            Block { id, start, end }
        })
        .collect()
}

// ── One-shot result slots ──────────────────────────────────────────────

/// Write half of a one-shot slot. Filling consumes it, so a block can
/// deliver at most one result.
#[derive(Debug)]
pub struct SlotSender<T> {
    inner: Sender<T>,
}

/// Read half of a one-shot slot.
#[derive(Debug)]
pub struct SlotReceiver<T> {
    inner: Receiver<T>,
}

#[must_use]
pub fn result_slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (SlotSender { inner: tx }, SlotReceiver { inner: rx })
}

impl<T> SlotSender<T> {
    pub fn fill(self, value: T) {
        // The receiver only disappears if the gatherer itself is gone, in
        // which case nobody is left to read the value.
        let _ = self.inner.send(value);
    }
}

impl<T> SlotReceiver<T> {
    /// Block until the value arrives. `None` if the sender was dropped
    /// without filling the slot.
    pub fn wait(self) -> Option<T> {
        self.inner.recv().ok()
    }
}

// ── Scatter / gather ───────────────────────────────────────────────────

/// Partition `rows` into one block per worker, run `map` on every block in
/// the pool, then `merge` the partials (ordered by block id) on the calling
/// thread.
pub fn scatter_gather<P, R, M, G>(
    pool: &WorkerPool,
    rows: usize,
    map: M,
    merge: G,
) -> Result<R, ExecError>
where
    P: Send + 'static,
    M: Fn(Block) -> P + Send + Sync + 'static,
    G: FnOnce(Vec<P>) -> R,
{
    scatter_gather_blocks(pool, partition(rows, pool.worker_count()), map, merge)
}

/// [`scatter_gather`] over an explicit block list.
pub fn scatter_gather_blocks<P, R, M, G>(
    pool: &WorkerPool,
    blocks: Vec<Block>,
    map: M,
    merge: G,
) -> Result<R, ExecError>
where
    P: Send + 'static,
    M: Fn(Block) -> P + Send + Sync + 'static,
    G: FnOnce(Vec<P>) -> R,
{
    let map = Arc::new(map);
    debug!(blocks = blocks.len(), "scatter");

    let pending = blocks
        .into_iter()
        .map(|block| {
            let (slot, receiver) = result_slot();
            let map = Arc::clone(&map);
            pool.enqueue(move || {
                let partial = (*map)(block);
                trace!(block = block.id, rows = block.len(), "block finished");
                slot.fill(partial);
            });
            (block.id, receiver)
        })
        .collect::<Vec<_>>();

    let mut partials = Vec::with_capacity(pending.len());
    for (block, receiver) in pending {
        partials.push(receiver.wait().ok_or(ExecError::WorkerLost { block })?);
    }

    Ok(merge(partials))
}
