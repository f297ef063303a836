//! Structured cancellation.
//!
//! A [`CancellationToken`] is a shared flag that futures can wait on. Tokens
//! form a tree: cancelling a token cancels every token derived from it with
//! [`child_token`](CancellationToken::child_token), never the other way round.
//! A [`CancelScope`] ties a token to a lexical scope and cancels it on drop.

use parking_lot::Mutex;
use pin_project::pin_project;
use slab::Slab;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// Returned by futures cut short by a cancellation token.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation was cancelled")]
pub struct Cancelled;

#[derive(Default)]
struct Inner {
    // Written under `waiters`, read locklessly on the fast path.
    cancelled: AtomicBool,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    wakers: Slab<Waker>,
    children: Vec<Weak<Inner>>,
}

impl Inner {
    fn cancel(&self) {
        let (wakers, children) = {
            let mut waiters = self.waiters.lock();
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            (
                std::mem::take(&mut waiters.wakers),
                std::mem::take(&mut waiters.children),
            )
        };

        for (_, waker) in wakers {
            waker.wake();
        }

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A cloneable cancellation flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels this token and all of its children. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A token cancelled together with this one, but which can also be
    /// cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();

        {
            let mut waiters = self.inner.waiters.lock();
            if !self.is_cancelled() {
                waiters.children.retain(|c| c.strong_count() > 0);
                waiters.children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }

        child.cancel();
        child
    }

    /// Future that resolves once the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellation {
        WaitForCancellation {
            token: self.clone(),
            key: None,
        }
    }

    /// Runs `future` until it completes or this token is cancelled.
    pub fn wrap<F: Future>(&self, future: F) -> Cancellable<F> {
        Cancellable::new(future, self.clone())
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct WaitForCancellation {
    token: CancellationToken,
    key: Option<usize>,
}

impl Future for WaitForCancellation {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        let inner = Arc::clone(&self.token.inner);
        let mut waiters = inner.waiters.lock();
        if inner.cancelled.load(Ordering::Acquire) {
            return Poll::Ready(());
        }

        match self.key.and_then(|key| waiters.wakers.get_mut(key)) {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            Some(waker) => *waker = cx.waker().clone(),
            None => self.key = Some(waiters.wakers.insert(cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for WaitForCancellation {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.token.inner.waiters.lock().wakers.try_remove(key);
        }
    }
}

#[pin_project(project = StateProj)]
enum State<F> {
    Running(#[pin] F),
    Done,
}

/// Future returned by [`CancellationToken::wrap`] and
/// [`Task::with_cancellation`](crate::task::Task::with_cancellation).
///
/// Resolves to `Err(Cancelled)` as soon as the token fires. The inner future
/// is dropped at that point, so an in-flight io operation gets cancelled in
/// the kernel.
#[pin_project]
#[must_use = "futures do nothing unless awaited"]
pub struct Cancellable<F> {
    #[pin]
    state: State<F>,
    cancelled: WaitForCancellation,
}

impl<F: Future> Cancellable<F> {
    pub fn new(future: F, token: CancellationToken) -> Self {
        Self {
            state: State::Running(future),
            cancelled: token.cancelled(),
        }
    }
}

impl<F: Future> Future for Cancellable<F> {
    type Output = Result<F::Output, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if Pin::new(&mut *this.cancelled).poll(cx).is_ready() {
            this.state.set(State::Done);
            return Poll::Ready(Err(Cancelled));
        }

        match this.state.as_mut().project() {
            StateProj::Running(future) => match future.poll(cx) {
                Poll::Ready(out) => {
                    this.state.set(State::Done);
                    Poll::Ready(Ok(out))
                }
                Poll::Pending => Poll::Pending,
            },
            StateProj::Done => panic!("`Cancellable` polled after completion"),
        }
    }
}

impl<F> fmt::Debug for Cancellable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("token", &self.cancelled.token)
            .finish()
    }
}

/// Cancels its token when dropped.
///
/// Work started with the scope's token stops at its next suspension point
/// once the scope ends, whichever thread it runs on.
#[derive(Debug, Default)]
pub struct CancelScope {
    token: CancellationToken,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope nested in `parent`: it ends early if the parent is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn wrap<F: Future>(&self, future: F) -> Cancellable<F> {
        self.token.wrap(future)
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(CancellationToken: Send, Sync, Clone);
    assert_impl_all!(Cancellable<std::future::Pending<()>>: Send);

    #[test]
    fn test_cancel_wakes_waiters_once() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let token = CancellationToken::new();
        let mut a = token.cancelled();
        let mut b = token.cancelled();
        assert!(Pin::new(&mut a).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut b).poll(&mut cx).is_pending());
        // Re-polling with the same waker does not register twice.
        assert!(Pin::new(&mut a).poll(&mut cx).is_pending());

        token.cancel();
        token.cancel();
        assert_eq!(data.wake_count(), 2);
        assert!(Pin::new(&mut a).poll(&mut cx).is_ready());
        assert!(Pin::new(&mut b).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_dropped_waiter_is_unregistered() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let token = CancellationToken::new();
        let mut wait = token.cancelled();
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        drop(wait);

        token.cancel();
        assert_eq!(data.wake_count(), 0);
    }

    #[test]
    fn test_child_tokens() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let grandchild = child.child_token();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(grandchild.is_cancelled());

        let sibling = parent.child_token();
        parent.cancel();
        assert!(sibling.is_cancelled());

        // Children of a cancelled token start cancelled.
        assert!(parent.child_token().is_cancelled());
    }

    #[test]
    fn test_cancellable_drops_inner_future() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(Arc::clone(&dropped));
        let token = CancellationToken::new();
        let mut fut = Box::pin(token.wrap(async move {
            let _flag = flag;
            std::future::pending::<()>().await
        }));

        assert!(fut.as_mut().poll(&mut cx).is_pending());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        token.cancel();
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Err(Cancelled)));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_cancels_on_drop() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let scope = CancelScope::new();
        let token = scope.token().clone();
        let mut fut = Box::pin(scope.wrap(async { 3 }));
        assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(3)));

        drop(scope);
        assert!(token.is_cancelled());
    }
}
