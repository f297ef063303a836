//! Blocking bridges between threads and tasks.

mod event;
pub use event::ManualResetEvent;

mod sync_wait;
pub use sync_wait::sync_wait;
