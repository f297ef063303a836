use crate::context;
use crate::runtime::{ReadyQueue, RuntimeConfig, Schedule, Shared, ThreadTag};
use crate::task::Runnable;
use anyhow::{Result, anyhow};
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, ThreadId};

/// Max number of full passes over the other workers' queues before parking.
const MAX_STEAL_RETRIES: usize = 4;

/// The general purpose worker pool.
///
/// Producers push onto a shared [`ReadyQueue`]. An idle worker drains the
/// whole chain into its own FIFO deque, where the other workers can steal from
/// it, so a burst scheduled from one thread spreads across the pool.
pub(crate) struct WorkerPool {
    remote: ReadyQueue<Runnable>,
    shared: Shared,

    /// Handle to every worker's local queue, indexed by worker.
    stealers: Vec<Stealer<Runnable>>,

    handles: Mutex<HashMap<ThreadId, thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn start(cfg: &RuntimeConfig) -> Result<Arc<Self>> {
        let num_workers = cfg.worker_threads;

        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_fifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let pool = Arc::new(WorkerPool {
            remote: ReadyQueue::new(),
            shared: Shared::new(),
            stealers,
            handles: Mutex::new(HashMap::with_capacity(num_workers)),
        });

        for (index, local) in local_queues.into_iter().enumerate() {
            let mut builder = thread::Builder::new().name(cfg.thread_name.name(index));
            if let Some(stack_size) = cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let worker = Worker::new(Arc::clone(&pool), index, local);
            let handle = match builder.spawn(move || worker.run()) {
                Ok(handle) => handle,
                Err(e) => {
                    // Tear down what was started so far.
                    let _ = pool.shutdown();
                    return Err(anyhow!("failed to spawn worker thread {index}: {e}"));
                }
            };

            pool.handles.lock().insert(handle.thread().id(), handle);
        }

        tracing::debug!(num_workers, "worker pool started");
        Ok(pool)
    }

    fn has_work(&self) -> bool {
        !self.remote.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Stops and joins every worker. Runnables still queued are cancelled.
    ///
    /// Safe to call from a worker thread: that thread is not joined.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if !self.shared.signal_shutdown() {
            return Ok(());
        }

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());

        let panicked = handles
            .into_iter()
            .filter(|(thread_id, _)| *thread_id != current)
            .filter_map(|(thread_id, handle)| handle.join().err().map(|_| thread_id))
            .collect::<Vec<_>>();

        let cancelled = self.remote.drain().map(Runnable::cancel).count();
        tracing::debug!(cancelled, "worker pool shut down");

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", panicked.len()))
        }
    }
}

impl Schedule for WorkerPool {
    fn schedule(&self, runnable: Runnable) {
        if self.shared.is_shutdown() {
            tracing::trace!(task.id = ?runnable.id(), "pool shut down, cancelling runnable");
            runnable.cancel();
            return;
        }

        self.remote.push(runnable);
        self.shared.unpark_one_thread();

        // Lost the race with shutdown: the workers may already be gone.
        if self.shared.is_shutdown() {
            self.remote.drain().for_each(Runnable::cancel);
        }
    }

    fn thread_tag(&self) -> ThreadTag {
        ThreadTag::WORKER
    }
}

struct Worker {
    pool: Arc<WorkerPool>,
    index: usize,
    local: CbWorker<Runnable>,
    unpark: Arc<AtomicBool>,
}

impl Worker {
    fn new(pool: Arc<WorkerPool>, index: usize, local: CbWorker<Runnable>) -> Self {
        Worker {
            pool,
            index,
            local,
            unpark: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run(self) {
        context::set_thread_tag(ThreadTag::WORKER);
        tracing::debug!(worker = self.index, "worker started");

        // Each worker visits its siblings in its own order to spread contention.
        let mut siblings = (0..self.pool.stealers.len())
            .filter(|i| *i != self.index)
            .collect::<Vec<_>>();
        fastrand::shuffle(&mut siblings);

        loop {
            if let Some(runnable) = self.find_runnable(&siblings) {
                runnable.run();
                continue;
            }

            if self.pool.is_shutdown() {
                break;
            }

            let pool = &self.pool;
            pool.shared
                .park_current_thread(&self.unpark, || pool.has_work());
        }

        let cancelled = iter::from_fn(|| self.local.pop())
            .map(Runnable::cancel)
            .count();
        tracing::debug!(worker = self.index, cancelled, "worker stopped");
    }

    fn find_runnable(&self, siblings: &[usize]) -> Option<Runnable> {
        if self.pool.is_shutdown() {
            return None;
        }

        // 1. Local queue first, oldest entry first.
        if let Some(runnable) = self.local.pop() {
            return Some(runnable);
        }

        // 2. Take the whole remote chain. Others can steal the surplus.
        let mut drained = 0;
        for runnable in self.pool.remote.drain() {
            self.local.push(runnable);
            drained += 1;
        }
        if drained > 0 {
            tracing::trace!(worker = self.index, drained, "drained remote queue");
            if drained > 1 {
                self.pool.shared.unpark_one_thread();
            }
            return self.local.pop();
        }

        // 3. Steal from siblings.
        iter::repeat_with(|| {
            siblings
                .iter()
                .map(|i| self.pool.stealers[*i].steal_batch_and_pop(&self.local))
                .collect::<Steal<Runnable>>()
        })
        .take(MAX_STEAL_RETRIES)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }
}
