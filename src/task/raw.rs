use crate::context;
use crate::runtime::Schedule;
use crate::task::Id;
use crate::task::state::{State, TransitionToIdle};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work sitting in exactly one scheduler queue.
pub(crate) enum Runnable {
    /// A runtime task: polled on the thread that dequeues it.
    Task(Arc<RawTask>),

    /// A waker from a foreign executor: woken on the thread that dequeues it.
    Waker(Waker),
}

impl Runnable {
    pub(crate) fn run(self) {
        match self {
            Runnable::Task(task) => task.run(),
            Runnable::Waker(waker) => waker.wake(),
        }
    }

    /// Drops the work without running it. Used on scheduler shutdown.
    pub(crate) fn cancel(self) {
        match self {
            Runnable::Task(task) => task.cancel(),
            Runnable::Waker(waker) => drop(waker),
        }
    }

    pub(crate) fn id(&self) -> Option<Id> {
        match self {
            Runnable::Task(task) => Some(task.id()),
            Runnable::Waker(_) => None,
        }
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runnable::Task(task) => f.debug_tuple("Runnable::Task").field(&task.id()).finish(),
            Runnable::Waker(_) => f.write_str("Runnable::Waker"),
        }
    }
}

/// A spawned, type-erased future together with its scheduling state.
///
/// The waker of a `RawTask` is the task itself. Waking it dispatches the task
/// to its *affinity*: the scheduler it last moved to through a `schedule()`
/// awaitable. A task without affinity is resumed inline, on whichever thread
/// woke it.
pub(crate) struct RawTask {
    id: Id,
    state: State,
    future: Mutex<Option<BoxFuture>>,
    affinity: Mutex<Option<Arc<dyn Schedule>>>,
}

impl RawTask {
    pub(crate) fn new(id: Id, future: BoxFuture, affinity: Option<Arc<dyn Schedule>>) -> Arc<Self> {
        Arc::new(RawTask {
            id,
            state: State::new(),
            future: Mutex::new(Some(future)),
            affinity: Mutex::new(affinity),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn affinity(&self) -> Option<Arc<dyn Schedule>> {
        self.affinity.lock().clone()
    }

    pub(crate) fn set_affinity(&self, affinity: Option<Arc<dyn Schedule>>) {
        *self.affinity.lock() = affinity;
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Sends the task to its affinity, or runs it right here if it has none.
    pub(crate) fn dispatch(self: Arc<Self>) {
        match self.affinity() {
            Some(scheduler) => scheduler.schedule(Runnable::Task(self)),
            None => self.run(),
        }
    }

    /// Polls the task on the current thread until it is idle.
    pub(crate) fn run(self: Arc<Self>) {
        if !self.state.transition_to_running() {
            return;
        }

        loop {
            let poll = self.poll_future();

            match poll {
                Poll::Ready(()) => {
                    self.state.transition_to_complete();
                    self.drop_future();
                    return;
                }
                Poll::Pending => match self.state.transition_to_idle() {
                    TransitionToIdle::Idle => return,
                    TransitionToIdle::Cancelled => {
                        self.drop_future();
                        return;
                    }
                    TransitionToIdle::Notified => {
                        // Woken mid-poll, possibly after moving to another
                        // scheduler. Inline tasks loop instead of recursing.
                        if self.affinity().is_some() {
                            return self.dispatch();
                        }
                        if !self.state.transition_to_running() {
                            return;
                        }
                    }
                },
            }
        }
    }

    fn poll_future(self: &Arc<Self>) -> Poll<()> {
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let _guard = TaskGuard::enter(Arc::clone(self));

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return Poll::Ready(());
        };

        // Spawned futures catch their own panics; this only guards the state
        // word against a misbehaving internal future.
        match std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(poll) => poll,
            Err(_) => {
                tracing::error!(task.id = %self.id, "runnable panicked outside of its catch guard");
                Poll::Ready(())
            }
        }
    }

    fn drop_future(&self) {
        // Dropped outside the lock: drop glue may wake or cancel other tasks.
        let future = self.future.lock().take();
        drop(future);
    }

    /// Drops the future without completing it. Its join handle observes
    /// `TaskError::Cancelled`.
    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.state.transition_to_cancelled() {
            self.drop_future();
        }
    }
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        if self.state.transition_to_notified() {
            self.dispatch();
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.state.transition_to_notified() {
            Arc::clone(self).dispatch();
        }
    }
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Sets the current task in the thread context while a runnable is polled,
/// restoring the outer one on drop (runnables nest when started inline).
struct TaskGuard {
    parent: Option<Arc<RawTask>>,
}

impl TaskGuard {
    fn enter(task: Arc<RawTask>) -> Self {
        TaskGuard {
            parent: context::set_current_task(Some(task)),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        context::set_current_task(self.parent.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(RawTask: Send, Sync);
    assert_impl_all!(Runnable: Send);

    fn counting_future(polls: Arc<AtomicUsize>, until: usize) -> BoxFuture {
        Box::pin(std::future::poll_fn(move |cx| {
            let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= until {
                Poll::Ready(())
            } else {
                // Self-wake while running: must be re-dispatched exactly once.
                cx.waker().wake_by_ref();
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }))
    }

    #[test]
    fn test_inline_task_loops_until_ready() {
        let polls = Arc::new(AtomicUsize::new(0));
        let task = RawTask::new(Id::next(), counting_future(polls.clone(), 3), None);

        Arc::clone(&task).run();

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(task.is_complete());
    }

    #[test]
    fn test_self_wake_redispatches_once_to_affinity() -> Result<()> {
        let scheduler = Arc::new(TrackingScheduler::new());
        let polls = Arc::new(AtomicUsize::new(0));
        let task = RawTask::new(
            Id::next(),
            counting_future(polls.clone(), 2),
            Some(scheduler.clone() as Arc<dyn Schedule>),
        );

        Arc::clone(&task).dispatch();
        assert_eq!(scheduler.tracker.num_calls(&Method::Schedule), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 0);

        // First poll wakes itself twice, which yields a single re-dispatch.
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.tracker.num_calls(&Method::Schedule), 2);

        assert_eq!(scheduler.run_pending(), 1);
        assert!(task.is_complete());
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.tracker.num_calls(&Method::Schedule), 2);
        Ok(())
    }

    #[test]
    fn test_current_task_is_set_while_polling() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let id = Id::next();

        let task = RawTask::new(
            id,
            Box::pin(async move {
                *seen_clone.lock() = crate::task::try_id();
            }),
            None,
        );

        task.run();
        assert_eq!(*seen.lock(), Some(id));
        assert!(crate::task::try_id().is_none());
    }

    #[test]
    fn test_cancel_drops_future_and_skips_queued_run() {
        let scheduler = Arc::new(TrackingScheduler::new());
        let dropped = Arc::new(AtomicUsize::new(0));
        let guard = DropCounter(Arc::clone(&dropped));

        let task = RawTask::new(
            Id::next(),
            Box::pin(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            }),
            Some(scheduler.clone() as Arc<dyn Schedule>),
        );

        Arc::clone(&task).dispatch();
        task.cancel();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        // Still queued, but completing it is a no-op.
        assert_eq!(scheduler.run_pending(), 1);
        assert!(task.is_complete());
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
