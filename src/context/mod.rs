//! Thread-local execution context.
//!
//! Tracks the runnable currently being polled on this thread and the role of
//! the thread (worker, render, io). Nothing here is process-global: schedulers
//! are reached through the handles stored in runnables, never through statics.

use crate::runtime::ThreadTag;
use crate::task::{Id, RawTask};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

struct Context {
    current_task: RefCell<Option<Arc<RawTask>>>,
    thread_tag: Cell<ThreadTag>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            current_task: RefCell::new(None),
            thread_tag: Cell::new(ThreadTag::empty()),
        }
    };
}

/// Returns the runnable being polled on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<RawTask>> {
    CONTEXT
        .try_with(|ctx| ctx.current_task.borrow().clone())
        .ok()
        .flatten()
}

pub(crate) fn current_task_id() -> Option<Id> {
    CONTEXT
        .try_with(|ctx| ctx.current_task.borrow().as_ref().map(|task| task.id()))
        .ok()
        .flatten()
}

/// Replaces the current runnable and returns the previous one.
pub(crate) fn set_current_task(task: Option<Arc<RawTask>>) -> Option<Arc<RawTask>> {
    CONTEXT
        .try_with(|ctx| ctx.current_task.replace(task))
        .ok()
        .flatten()
}

pub(crate) fn thread_tag() -> ThreadTag {
    CONTEXT
        .try_with(|ctx| ctx.thread_tag.get())
        .unwrap_or(ThreadTag::empty())
}

/// Adds `tag` to the current thread's role and returns the previous role.
pub(crate) fn add_thread_tag(tag: ThreadTag) -> ThreadTag {
    CONTEXT
        .try_with(|ctx| {
            let prev = ctx.thread_tag.get();
            ctx.thread_tag.set(prev | tag);
            prev
        })
        .unwrap_or(ThreadTag::empty())
}

pub(crate) fn set_thread_tag(tag: ThreadTag) {
    let _ = CONTEXT.try_with(|ctx| ctx.thread_tag.set(tag));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tag_is_per_thread() -> anyhow::Result<()> {
        let prev = add_thread_tag(ThreadTag::RENDER);
        assert!(thread_tag().contains(ThreadTag::RENDER));

        let other = std::thread::spawn(thread_tag)
            .join()
            .map_err(|_| anyhow::anyhow!("thread panicked"))?;
        assert!(other.is_empty());

        set_thread_tag(prev);
        assert_eq!(thread_tag(), prev);
        Ok(())
    }

    #[test]
    fn test_no_current_task_outside_runtime() {
        assert!(current_task().is_none());
        assert!(current_task_id().is_none());
    }
}
