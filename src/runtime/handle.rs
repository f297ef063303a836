use crate::cache::ResourceCache;
use crate::io::IoHandle;
use crate::runtime::{RenderThread, RuntimeConfig, Schedule, ScheduleOn, WorkerPool};
use crate::task::{self, JoinHandle, Start, Task};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Scheduler a task is spawned onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The worker pool.
    Worker,
    /// The dedicated render thread.
    Render,
    /// Whichever thread next drives the io scheduler.
    Io,
}

/// Cheap, cloneable access to a [`Runtime`](crate::Runtime).
///
/// Handles are passed explicitly to the code that needs to schedule work,
/// load resources or issue io.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Arc<WorkerPool>,
    render: Arc<RenderThread>,
    io: IoHandle,
    cache: ResourceCache,
    cfg: RuntimeConfig,
}

impl Handle {
    pub(crate) fn new(
        pool: Arc<WorkerPool>,
        render: Arc<RenderThread>,
        io: IoHandle,
        cache: ResourceCache,
        cfg: RuntimeConfig,
    ) -> Self {
        Handle {
            inner: Arc::new(Inner {
                pool,
                render,
                io,
                cache,
                cfg,
            }),
        }
    }

    /// Awaitable that moves the current task onto the worker pool.
    pub fn schedule(&self) -> ScheduleOn {
        ScheduleOn::new(self.scheduler(Target::Worker))
    }

    /// Awaitable that moves the current task onto the render thread.
    pub fn schedule_render(&self) -> ScheduleOn {
        ScheduleOn::new(self.scheduler(Target::Render))
    }

    /// Awaitable that moves the current task onto an io thread.
    pub fn schedule_io(&self) -> ScheduleOn {
        self.inner.io.schedule()
    }

    pub fn io(&self) -> &IoHandle {
        &self.inner.io
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    pub fn worker_threads(&self) -> usize {
        self.inner.cfg.worker_threads
    }

    /// Spawns `future` onto the worker pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_on(Target::Worker, future)
    }

    /// Spawns `future` onto the given scheduler. It starts running there and
    /// stays there until it moves with a `schedule()` awaitable.
    pub fn spawn_on<F>(&self, target: Target, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        task::spawn_with(future, Some(self.scheduler(target)), Start::Dispatch)
    }

    /// Returns a task that hops to the worker pool and calls `f` there.
    pub fn run<F, R>(&self, f: F) -> Task<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let schedule = self.schedule();
        Task::new(async move {
            schedule.await;
            f()
        })
    }

    pub(crate) fn scheduler(&self, target: Target) -> Arc<dyn Schedule> {
        match target {
            Target::Worker => Arc::clone(&self.inner.pool) as Arc<dyn Schedule>,
            Target::Render => Arc::clone(&self.inner.render) as Arc<dyn Schedule>,
            Target::Io => self.inner.io.scheduler(),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub(crate) fn render(&self) -> &Arc<RenderThread> {
        &self.inner.render
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("worker_threads", &self.inner.cfg.worker_threads)
            .field("io_threads", &self.inner.cfg.io_threads)
            .finish_non_exhaustive()
    }
}
