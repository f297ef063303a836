use crate::cache::ResourceCache;
use crate::context;
use crate::io::{IoHandle, IoScheduler};
use crate::runtime::{Handle, RenderThread, ThreadTag, WorkerPool};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Default size for the io_uring SQ ring.
const IO_RING_SIZE: usize = 256;

/// Largest SQ ring the kernel accepts.
const MAX_IO_RING_SIZE: usize = 32768;

/// In-flight operation slots = `io_ring_size` * multiplier.
const IO_INFLIGHT_MULTIPLIER: usize = 2;

/// Max time `process_events` blocks before re-checking stop and overflow.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Number of threads driving `process_events`.
const IO_THREADS: usize = 1;

const CACHE_CAPACITY: usize = 8192;

const RENDER_THREAD_NAME: &str = "strand-render";

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn name(&self, index: usize) -> String {
        (self.0)(index)
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("strand-worker-{index}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Builds a [`Runtime`] with custom configuration values.
///
/// ```no_run
/// # fn doc() -> anyhow::Result<()> {
/// let rt = strand::Builder::new()
///     .worker_threads(4)
///     .io_threads(2)
///     .cache_capacity(1024)
///     .try_build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Defaults to the available parallelism.
    worker_threads: Option<usize>,

    /// Name fn used for worker threads, given the worker index.
    thread_name: ThreadNameFn,

    render_thread_name: String,

    /// Stack size used for every thread spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// Threads dedicated to `IoScheduler::process_events`. With zero, the
    /// application drives the io scheduler itself.
    io_threads: usize,

    /// Size of the io_uring SQ ring.
    io_ring_size: usize,

    /// The operation slab holds `io_ring_size * io_inflight_multiplier`
    /// entries, so a full SQ ring is recoverable (the operation is retried
    /// through the overflow list) while the slab still has room.
    io_inflight_multiplier: usize,

    io_poll_interval: Duration,

    /// Number of ready entries the resource cache keeps before evicting.
    cache_capacity: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            render_thread_name: RENDER_THREAD_NAME.to_string(),
            thread_stack_size: None,
            io_threads: IO_THREADS,
            io_ring_size: IO_RING_SIZE,
            io_inflight_multiplier: IO_INFLIGHT_MULTIPLIER,
            io_poll_interval: IO_POLL_INTERVAL,
            cache_capacity: CACHE_CAPACITY,
        }
    }

    /// The number of worker threads in the pool. The render thread and io
    /// threads do not count towards it.
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of every worker thread.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function used to name worker threads from their index.
    ///
    /// The default yields "strand-worker-{N}".
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    pub fn render_thread_name(mut self, val: impl Into<String>) -> Self {
        self.render_thread_name = val.into();
        self
    }

    /// Sets the stack size (in bytes) for threads spawned by the runtime.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn io_threads(mut self, val: usize) -> Self {
        self.io_threads = val;
        self
    }

    #[track_caller]
    pub fn io_ring_size(mut self, val: usize) -> Self {
        assert!(val.is_power_of_two(), "io_ring_size must be a power of two");
        assert!(
            val <= MAX_IO_RING_SIZE,
            "io_ring_size must be at most {MAX_IO_RING_SIZE}"
        );
        self.io_ring_size = val;
        self
    }

    #[track_caller]
    pub fn io_inflight_multiplier(mut self, val: usize) -> Self {
        assert!(val > 0, "io_inflight_multiplier must be greater than 0");
        self.io_inflight_multiplier = val;
        self
    }

    #[track_caller]
    pub fn io_poll_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "io_poll_interval must be greater than 0");
        self.io_poll_interval = val;
        self
    }

    #[track_caller]
    pub fn cache_capacity(mut self, val: usize) -> Self {
        assert!(val > 0, "cache_capacity must be greater than 0");
        self.cache_capacity = val;
        self
    }

    /// Creates the configured `Runtime`, starting all of its threads.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::start(cfg)
    }
}

/// The explicitly constructed runtime context.
///
/// Owns the worker pool, the render thread, the io scheduler with its threads,
/// and the resource cache. Call sites reach them through a [`Handle`]; there
/// is no process-wide instance.
///
/// Dropping the runtime shuts it down, see [`Runtime::shutdown`].
pub struct Runtime {
    handle: Handle,
    io_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Runtime {
    fn start(cfg: RuntimeConfig) -> Result<Runtime> {
        let io = IoScheduler::new(&cfg)?;
        let pool = WorkerPool::start(&cfg)?;

        let render = match RenderThread::start(&cfg) {
            Ok(render) => render,
            Err(e) => {
                let _ = pool.shutdown();
                return Err(e);
            }
        };

        let cache = ResourceCache::with_capacity(cfg.cache_capacity);
        let runtime = Runtime {
            handle: Handle::new(pool, render, io, cache, cfg.clone()),
            io_threads: Mutex::new(Vec::with_capacity(cfg.io_threads)),
            shut_down: AtomicBool::new(false),
        };

        for index in 0..cfg.io_threads {
            let io = runtime.handle.io().clone();
            let mut builder = thread::Builder::new().name(format!("strand-io-{index}"));
            if let Some(stack_size) = cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            // On error `runtime` is dropped, which shuts down what was started.
            let handle = builder
                .spawn(move || run_io_thread(io))
                .map_err(|e| anyhow!("failed to spawn io thread {index}: {e}"))?;
            runtime.io_threads.lock().push(handle);
        }

        tracing::debug!(
            worker_threads = cfg.worker_threads,
            io_threads = cfg.io_threads,
            "runtime started"
        );
        Ok(runtime)
    }

    /// Returns a cheap, cloneable handle to this runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drives `future` to completion on the current thread.
    ///
    /// This is [`sync_wait`](crate::sync::sync_wait): it must not be called
    /// from inside a task.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        crate::sync::sync_wait(future)
    }

    /// Shuts the runtime down.
    ///
    /// In order: stops the io threads, stops and joins the worker pool and the
    /// render thread, cancels in-flight io and waits for the kernel to release
    /// every buffer, then clears the cache. Tasks that had not completed are
    /// dropped; their `JoinHandle`s resolve to a cancelled `TaskError`.
    ///
    /// The thread initiating the shutdown blocks until all of this is done.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!("runtime shutting down");
        let io = self.handle.io();
        io.stop();

        let io_threads = std::mem::take(&mut *self.io_threads.lock());
        let panicked = io_threads
            .into_iter()
            .filter_map(|handle| handle.join().err())
            .count();
        if panicked > 0 {
            tracing::error!(panicked, "io thread(s) panicked");
        }

        if let Err(e) = self.handle.pool().shutdown() {
            tracing::error!(error = %e, "error during worker pool shutdown");
        }

        if let Err(e) = self.handle.render().shutdown() {
            tracing::error!(error = %e, "error during render thread shutdown");
        }

        if let Err(e) = io.shutdown() {
            tracing::error!(error = %e, "error during io scheduler shutdown");
        }

        self.handle.cache().clear();
        tracing::debug!("runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn run_io_thread(io: IoHandle) {
    context::set_thread_tag(ThreadTag::IO);
    tracing::debug!("io thread started");

    io.process_events();

    tracing::debug!("io thread stopped");
}

// Export runtime builder as a RuntimeConfig object to be consumed by each
// scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) render_thread_name: String,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) io_threads: usize,
    pub(crate) io_ring_size: usize,
    pub(crate) io_inflight_multiplier: usize,
    pub(crate) io_poll_interval: Duration,
    pub(crate) cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 1,
            thread_name: default_thread_name_fn(),
            render_thread_name: RENDER_THREAD_NAME.to_string(),
            thread_stack_size: None,
            io_threads: IO_THREADS,
            io_ring_size: IO_RING_SIZE,
            io_inflight_multiplier: IO_INFLIGHT_MULTIPLIER,
            io_poll_interval: IO_POLL_INTERVAL,
            cache_capacity: CACHE_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow!("worker_threads must be greater than 0"));
        }

        if !self.io_ring_size.is_power_of_two() || self.io_ring_size > MAX_IO_RING_SIZE {
            return Err(anyhow!(
                "io_ring_size must be a power of two no larger than {MAX_IO_RING_SIZE}, got {}",
                self.io_ring_size
            ));
        }

        // Slab keys are carried in `user_data` next to two reserved values.
        self.io_ring_size
            .checked_mul(self.io_inflight_multiplier)
            .filter(|slots| *slots > 0 && (*slots as u64) < u64::MAX - 1)
            .ok_or_else(|| anyhow!("io_inflight_multiplier is out of range"))?;

        Ok(())
    }

    /// Capacity of the io operation slab.
    pub(crate) fn io_slab_size(&self) -> usize {
        self.io_ring_size * self.io_inflight_multiplier
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            thread_name: builder.thread_name,
            render_thread_name: builder.render_thread_name,
            thread_stack_size: builder.thread_stack_size,
            io_threads: builder.io_threads,
            io_ring_size: builder.io_ring_size,
            io_inflight_multiplier: builder.io_inflight_multiplier,
            io_poll_interval: builder.io_poll_interval,
            cache_capacity: builder.cache_capacity,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // Cloned into every scheduler at construction.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);
    assert_impl_all!(Runtime: Send, Sync);

    #[test]
    fn test_builder_defaults() -> Result<()> {
        let cfg = RuntimeConfig::try_from(Builder::new().worker_threads(3))?;

        assert_eq!(cfg.worker_threads, 3);
        assert_eq!(cfg.thread_name.name(2), "strand-worker-2");
        assert_eq!(cfg.render_thread_name, "strand-render");
        assert_eq!(cfg.io_threads, 1);
        assert_eq!(cfg.io_slab_size(), IO_RING_SIZE * IO_INFLIGHT_MULTIPLIER);
        assert_eq!(cfg.cache_capacity, CACHE_CAPACITY);
        Ok(())
    }

    #[test]
    fn test_thread_name_fn() -> Result<()> {
        let cfg = RuntimeConfig::try_from(
            Builder::new()
                .worker_threads(1)
                .thread_name_fn(|i| format!("asset-{i}")),
        )?;
        assert_eq!(cfg.thread_name.name(7), "asset-7");
        Ok(())
    }

    #[rstest]
    #[case::zero_workers(|| { Builder::new().worker_threads(0); })]
    #[case::ring_not_power_of_two(|| { Builder::new().io_ring_size(100); })]
    #[case::ring_too_large(|| { Builder::new().io_ring_size(65536); })]
    #[case::zero_multiplier(|| { Builder::new().io_inflight_multiplier(0); })]
    #[case::zero_poll_interval(|| { Builder::new().io_poll_interval(Duration::ZERO); })]
    #[case::zero_cache(|| { Builder::new().cache_capacity(0); })]
    #[case::odd_stack(|| { Builder::new().thread_stack_size(3000); })]
    fn test_builder_rejects(#[case] build: fn()) {
        assert!(std::panic::catch_unwind(build).is_err());
    }

    #[test]
    fn test_validate_catches_bad_config() {
        let cfg = RuntimeConfig {
            worker_threads: 0,
            ..RuntimeConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RuntimeConfig {
            io_ring_size: 48,
            ..RuntimeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
