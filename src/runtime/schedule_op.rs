use crate::context;
use crate::runtime::{Schedule, ThreadTag};
use crate::task::Runnable;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake};

/// Moves the awaiting task onto another scheduler.
///
/// Returned by `schedule()` on the runtime handle and on the io scheduler.
/// When awaited from a runtime task, the task is re-queued on the target and
/// resumes on one of its threads; it stays there (its waker dispatches to the
/// target) until it moves again.
///
/// Awaited from a foreign executor, the target only wakes the caller's waker
/// from one of its threads. Where the caller then resumes is up to that
/// executor.
///
/// The hop takes effect when the task's current poll returns. A combinator
/// that polls this future again within that same poll sees it ready while
/// still on the old thread.
#[must_use = "futures do nothing unless awaited"]
pub struct ScheduleOn {
    target: Arc<dyn Schedule>,
    queued: bool,
}

impl ScheduleOn {
    pub(crate) fn new(target: Arc<dyn Schedule>) -> Self {
        ScheduleOn {
            target,
            queued: false,
        }
    }
}

impl Future for ScheduleOn {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.queued {
            return Poll::Ready(());
        }
        self.queued = true;

        match context::current_task() {
            Some(task) => {
                // The runner dispatches to the new affinity once this poll
                // returns, so the hop happens after the task is idle. The
                // runnable is woken directly: `cx` may carry a combinator's
                // waker rather than the task's own.
                task.set_affinity(Some(Arc::clone(&self.target)));
                task.wake();
            }
            None => self.target.schedule(Runnable::Waker(cx.waker().clone())),
        }

        Poll::Pending
    }
}

impl fmt::Debug for ScheduleOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag: ThreadTag = self.target.thread_tag();
        f.debug_struct("ScheduleOn")
            .field("target", &tag)
            .field("queued", &self.queued)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{self, Start};
    use crate::test_utils::*;
    use std::pin::pin;

    #[test]
    fn test_hop_requeues_task_on_target() {
        let target = Arc::new(TrackingScheduler::new());
        let moved = target.clone() as Arc<dyn Schedule>;

        let handle = task::spawn_with(
            async move {
                ScheduleOn::new(moved).await;
                7
            },
            None,
            Start::Inline,
        );

        // First poll ran inline and left the task queued on the target.
        assert!(!handle.is_finished());
        assert_eq!(target.tracker.num_calls(&Method::Schedule), 1);

        assert_eq!(target.run_pending(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_hop_wakes_task_under_foreign_waker() {
        let target = Arc::new(TrackingScheduler::new());
        let moved = target.clone() as Arc<dyn Schedule>;

        // The hop is polled with a waker that is not the task's own.
        let handle = task::spawn_with(
            async move {
                let mut hop = pin!(ScheduleOn::new(moved));
                let (waker, data) = mock_waker();
                {
                    let mut cx = Context::from_waker(&waker);
                    assert!(hop.as_mut().poll(&mut cx).is_pending());
                }
                assert_eq!(data.wake_count(), 0);

                // Suspend without waking anything: only the hop re-queues us.
                let mut suspended = false;
                std::future::poll_fn(|_| {
                    if std::mem::replace(&mut suspended, true) {
                        Poll::Ready(())
                    } else {
                        Poll::Pending
                    }
                })
                .await;
                5
            },
            None,
            Start::Inline,
        );

        assert!(!handle.is_finished());
        assert_eq!(target.tracker.num_calls(&Method::Schedule), 1);

        assert_eq!(target.run_pending(), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_foreign_waker_is_queued() {
        let target = Arc::new(TrackingScheduler::new());
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut op = pin!(ScheduleOn::new(target.clone() as Arc<dyn Schedule>));
        assert!(op.as_mut().poll(&mut cx).is_pending());
        assert_eq!(data.wake_count(), 0);

        assert_eq!(target.run_pending(), 1);
        assert_eq!(data.wake_count(), 1);
        assert!(op.as_mut().poll(&mut cx).is_ready());
    }
}
