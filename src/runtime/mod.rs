use crate::context;
use crate::task::Runnable;
use bitflags::bitflags;

// Public API
mod handle;
pub use handle::{Handle, Target};

#[allow(clippy::module_inception)]
pub mod runtime;
pub use runtime::{Builder, Runtime};
pub(crate) use runtime::RuntimeConfig;

mod schedule_op;
pub use schedule_op::ScheduleOn;

// Exports
mod park;
pub(crate) use park::Shared;

pub(crate) mod pool;
pub(crate) use pool::WorkerPool;

mod queue;
pub(crate) use queue::ReadyQueue;

pub(crate) mod render;
pub(crate) use render::RenderThread;


/// A place runnables can be sent to.
///
/// Implemented by the worker pool, the render thread and the io scheduler.
/// A runnable handed to `schedule` is owned by the scheduler from then on: it
/// is either run exactly once or, after shutdown, cancelled.
pub(crate) trait Schedule: Send + Sync + 'static {
    fn schedule(&self, runnable: Runnable);

    /// Role of the threads that drain this scheduler.
    fn thread_tag(&self) -> ThreadTag;
}

bitflags! {
    /// Role of a runtime thread. A thread driving the io scheduler from a
    /// worker loop carries both tags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadTag: u8 {
        const WORKER = 1;
        const RENDER = 1 << 1;
        const IO = 1 << 2;
    }
}

/// Role of the calling thread. Empty on threads the runtime does not own.
pub fn current_thread_tag() -> ThreadTag {
    context::thread_tag()
}

/// Returns true on the render thread.
pub fn is_render_thread() -> bool {
    context::thread_tag().contains(ThreadTag::RENDER)
}
