//! A task runtime built around lazy tasks, a worker pool with a dedicated
//! render thread, an io_uring-backed io scheduler, and a single-flight
//! resource cache.
//!
//! Everything hangs off an explicitly constructed [`Runtime`]; code that needs
//! to schedule work is handed a [`Handle`].

mod context;

pub mod cache;
pub use cache::{CacheError, LoadDescriptor, ResourceCache};

pub mod cancel;
pub use cancel::{CancelScope, CancellationToken, Cancelled};

pub mod combinator;
pub use combinator::{when_all_ready, when_all_ready_tuple};

pub mod io;

pub mod runtime;
pub use runtime::{Builder, Handle, Runtime, Target};

pub mod sync;
pub use sync::sync_wait;

pub mod task;
pub use task::{JoinHandle, Task, TaskError};

mod utils;

#[cfg(test)]
mod test_utils;
