use crate::cancel::{Cancellable, CancellationToken, Cancelled};
use crate::task::TaskError;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed but never polled. No work has run yet.
    Created,
    /// Polled at least once and not finished.
    Running,
    /// Produced its value.
    Completed,
    /// The body panicked.
    Panicked,
}

/// A lazy, single-consumer unit of async work.
///
/// Nothing runs until the task is awaited (or handed to `spawn`,
/// `when_all_ready` or `sync_wait`). Exactly one consumer observes the result.
/// A panic inside the body is captured and re-raised in the awaiting context,
/// or surfaced as a [`TaskError`] through [`Task::catch_unwind`].
///
/// Dropping a task that was never started never runs its body.
#[must_use = "tasks do nothing unless awaited"]
pub struct Task<T> {
    future: Option<Pin<Box<dyn Future<Output = T> + Send + 'static>>>,
    state: TaskState,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Task {
            future: Some(Box::pin(future)),
            state: TaskState::Created,
        }
    }

    /// A task that completes immediately with `value`.
    pub fn ready(value: T) -> Self {
        Task::new(std::future::ready(value))
    }

    /// Resolves to `Err(Cancelled)` as soon as `token` fires, dropping the body
    /// at its current suspension point.
    pub fn with_cancellation(self, token: CancellationToken) -> Task<Result<T, Cancelled>> {
        Task::new(Cancellable::new(self, token))
    }
}

impl<T> Task<T> {
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Returns true once the result has been consumed or the body panicked.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Panicked)
    }

    /// Awaits the task, capturing a panic in its body as a [`TaskError`]
    /// instead of unwinding into the awaiting context.
    pub fn catch_unwind(self) -> CatchUnwind<T> {
        CatchUnwind { task: self }
    }

    pub(crate) fn poll_caught(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError>> {
        let Some(future) = self.future.as_mut() else {
            panic!("`Task` polled after completion");
        };

        self.state = TaskState::Running;
        let poll = std::panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));

        match poll {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                self.future = None;
                self.state = TaskState::Completed;
                Poll::Ready(Ok(value))
            }
            Err(payload) => {
                self.future = None;
                self.state = TaskState::Panicked;
                Poll::Ready(Err(TaskError::panic(None, payload)))
            }
        }
    }
}

impl<T> Unpin for Task<T> {}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match self.poll_caught(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(err)) => match err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(err) => unreachable!("inline task cannot be cancelled: {err}"),
            },
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("state", &self.state).finish()
    }
}

/// Future returned by [`Task::catch_unwind`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct CatchUnwind<T> {
    task: Task<T>,
}

impl<T> Future for CatchUnwind<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task.poll_caught(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    assert_impl_all!(Task<u32>: Send, Unpin);

    #[test]
    fn test_task_is_lazy() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let task = Task::new(async move { ran_clone.store(true, Ordering::SeqCst) });
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.is_ready());

        drop(task);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_state_transitions() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut yielded = false;
        let mut task = Task::new(std::future::poll_fn(move |cx| {
            if yielded {
                Poll::Ready(7)
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }));

        assert!(Pin::new(&mut task).poll(&mut cx).is_pending());
        assert_eq!(task.state(), TaskState::Running);

        assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready(7));
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_ready());
    }

    #[test]
    fn test_catch_unwind_captures_panic() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut caught = Task::<u32>::new(async { panic!("boom") }).catch_unwind();
        match Pin::new(&mut caught).poll(&mut cx) {
            Poll::Ready(Err(err)) => {
                assert!(err.is_panic());
                assert_eq!(err.panic_message(), Some("boom"));
                assert!(err.id().is_none());
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert_eq!(caught.task.state(), TaskState::Panicked);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_await_reraises_panic() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut task = Task::<()>::new(async { panic!("boom") });
        let _ = Pin::new(&mut task).poll(&mut cx);
    }

    #[test]
    fn test_with_cancellation() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let token = CancellationToken::new();
        let mut task = Task::new(std::future::pending::<()>()).with_cancellation(token.clone());
        assert!(Pin::new(&mut task).poll(&mut cx).is_pending());

        token.cancel();
        assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready(Err(Cancelled)));
    }
}
