use crate::task::{Id, RawTask, TaskError};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// Output slot shared between a spawned task and its [`JoinHandle`].
pub(crate) struct JoinState<T> {
    output: Mutex<Option<Result<T, TaskError>>>,
    complete: AtomicBool,
    waker: AtomicWaker,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(JoinState {
            output: Mutex::new(None),
            complete: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        })
    }

    /// Stores the task result. Only the first call has an effect.
    pub(crate) fn complete(&self, result: Result<T, TaskError>) {
        {
            let mut output = self.output.lock();
            if self.complete.load(Ordering::Acquire) {
                return;
            }
            *output = Some(result);
            self.complete.store(true, Ordering::Release);
        }

        self.waker.wake();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    fn poll_output(&self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError>> {
        if !self.is_complete() {
            self.waker.register(cx.waker());
            if !self.is_complete() {
                return Poll::Pending;
            }
        }

        match self.output.lock().take() {
            Some(output) => Poll::Ready(output),
            None => panic!("`JoinHandle` polled after completion"),
        }
    }
}

/// An owned permission to join on a spawned task.
///
/// The task starts as soon as it is spawned, whether or not the handle is ever
/// awaited. Dropping a `JoinHandle` *detaches* the task: it keeps running and
/// its output is discarded.
///
/// Awaiting the handle yields `Err(TaskError)` if the task panicked or was
/// cancelled, for example because the runtime shut down before it finished.
///
/// ```no_run
/// # fn doc() -> anyhow::Result<()> {
/// let rt = strand::Builder::new().worker_threads(2).try_build()?;
/// let handle = rt.handle().spawn(async { 5 + 3 });
///
/// assert_eq!(rt.block_on(handle)?, 8);
/// # Ok(())
/// # }
/// ```
pub struct JoinHandle<T> {
    id: Id,
    task: Arc<RawTask>,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: Id, task: Arc<RawTask>, state: Arc<JoinState<T>>) -> Self {
        JoinHandle { id, task, state }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns true once the task has produced its output (or failed).
    pub fn is_finished(&self) -> bool {
        self.state.is_complete()
    }

    /// Cancels the task. If it is currently being polled, it is dropped once
    /// the poll returns. Awaiting the handle afterwards yields a cancelled
    /// [`TaskError`], unless the task had already completed.
    pub fn abort(&self) {
        self.task.cancel();
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.poll_output(cx)
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
