//! Tasks: lazy [`Task`] values, spawned runnables and their join handles.

use crate::runtime::Schedule;
use crate::utils::ScopeGuard;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

mod error;
pub use self::error::TaskError;

pub mod id;
pub use self::id::{Id, id, try_id};

mod join;
pub use self::join::JoinHandle;
pub(crate) use self::join::JoinState;

mod raw;
pub(crate) use self::raw::{RawTask, Runnable};

mod state;

#[allow(clippy::module_inception)]
mod task;
pub use self::task::{CatchUnwind, Task, TaskState};

/// Where a freshly spawned runnable gets its first poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Start {
    /// Queue it on its affinity. Runs inline if it has none.
    Dispatch,
    /// Poll it right now on the calling thread, whatever its affinity.
    Inline,
}

/// Spawns `future` as its own runnable and returns a handle to its output.
///
/// Panics in `future` are caught and surface as [`TaskError`]. If the runnable
/// is dropped before completing (scheduler shutdown, [`JoinHandle::abort`]),
/// the handle resolves to a cancelled `TaskError`.
pub(crate) fn spawn_with<F>(
    future: F,
    affinity: Option<Arc<dyn Schedule>>,
    start: Start,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = Id::next();
    let state = JoinState::new();
    let completer = Arc::clone(&state);
    let canceller = Arc::clone(&state);

    // Built outside the async block so that dropping a never-polled runnable
    // still resolves the handle.
    let guard = ScopeGuard::new(move || canceller.complete(Err(TaskError::cancelled(Some(id)))));

    let wrapped = async move {
        let mut guard = guard;
        let out = AssertUnwindSafe(future).catch_unwind().await;
        guard.disarm();

        completer.complete(out.map_err(|payload| TaskError::panic(Some(id), payload)));
    };

    let raw = RawTask::new(id, Box::pin(wrapped), affinity);
    let handle = JoinHandle::new(id, Arc::clone(&raw), state);

    tracing::trace!(task.id = %id, ?start, "spawn");
    match start {
        Start::Dispatch => raw.dispatch(),
        Start::Inline => raw.run(),
    }

    handle
}

/// The affinity a child spawned from the current context inherits.
pub(crate) fn inherited_affinity() -> Option<Arc<dyn Schedule>> {
    crate::context::current_task().and_then(|task| task.affinity())
}
