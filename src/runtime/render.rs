use crate::context;
use crate::runtime::{ReadyQueue, RuntimeConfig, Schedule, Shared, ThreadTag};
use crate::task::Runnable;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

/// The dedicated thread for serialized work.
///
/// Everything scheduled here runs on one OS thread, in the order it was
/// scheduled from any single producer.
pub(crate) struct RenderThread {
    queue: ReadyQueue<Runnable>,
    shared: Shared,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RenderThread {
    pub(crate) fn start(cfg: &RuntimeConfig) -> Result<Arc<Self>> {
        let render = Arc::new(RenderThread {
            queue: ReadyQueue::new(),
            shared: Shared::new(),
            handle: Mutex::new(None),
        });

        let mut builder = thread::Builder::new().name(cfg.render_thread_name.clone());
        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread = Arc::clone(&render);
        let handle = builder
            .spawn(move || thread.run())
            .map_err(|e| anyhow!("failed to spawn render thread: {e}"))?;

        *render.handle.lock() = Some(handle);
        Ok(render)
    }

    fn run(&self) {
        context::set_thread_tag(ThreadTag::RENDER);
        tracing::debug!("render thread started");

        let unpark = Arc::new(AtomicBool::new(false));

        while !self.shared.is_shutdown() {
            let mut ran = 0;
            for runnable in self.queue.drain() {
                runnable.run();
                ran += 1;
            }

            if ran > 0 {
                tracing::trace!(ran, "render batch");
                continue;
            }

            self.shared
                .park_current_thread(&unpark, || !self.queue.is_empty());
        }

        tracing::debug!("render thread stopped");
    }

    /// Stops and joins the render thread, cancelling whatever is still queued.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if !self.shared.signal_shutdown() {
            return Ok(());
        }

        let handle = self.handle.lock().take();
        let joined = match handle {
            Some(handle) if handle.thread().id() != thread::current().id() => handle.join(),
            _ => Ok(()),
        };

        let cancelled = self.queue.drain().map(Runnable::cancel).count();
        tracing::debug!(cancelled, "render thread shut down");

        joined.map_err(|_| anyhow!("render thread panicked"))
    }
}

impl Schedule for RenderThread {
    fn schedule(&self, runnable: Runnable) {
        if self.shared.is_shutdown() {
            runnable.cancel();
            return;
        }

        // Only the push that finds the queue empty can race with the thread
        // parking. Later pushes land in a batch it has not drained yet.
        if self.queue.push(runnable) {
            self.shared.unpark_one_thread();
        }

        if self.shared.is_shutdown() {
            self.queue.drain().for_each(Runnable::cancel);
        }
    }

    fn thread_tag(&self) -> ThreadTag {
        ThreadTag::RENDER
    }
}
