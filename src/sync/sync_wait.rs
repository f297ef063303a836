use crate::context;
use crate::sync::ManualResetEvent;
use crate::task::{Start, spawn_with};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

struct EventWaker(Arc<ManualResetEvent>);

impl Wake for EventWaker {
    fn wake(self: Arc<Self>) {
        self.0.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.set();
    }
}

/// Blocks the calling thread until `future` completes and returns its output.
///
/// The future runs as a root runnable, polled first on the calling thread.
/// After a `schedule()` hop its continuation runs on the target scheduler
/// while this thread sleeps on a [`ManualResetEvent`].
///
/// A panic in `future` is re-raised here with its original payload, exactly
/// as awaiting it would. Fallible futures hand back their own error type.
///
/// # Panics
///
/// Panics when called from inside a runtime task: blocking a scheduler thread
/// on work that may need that same thread deadlocks. Await the future instead.
/// Also panics if the runtime shuts down before the future completes.
#[track_caller]
pub fn sync_wait<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    assert!(
        context::current_task().is_none(),
        "`sync_wait` cannot be called from inside a task; `.await` the future instead"
    );

    let event = Arc::new(ManualResetEvent::new(false));
    let waker = Waker::from(Arc::new(EventWaker(Arc::clone(&event))));
    let mut cx = Context::from_waker(&waker);

    let mut handle = spawn_with(future, None, Start::Inline);

    loop {
        match Pin::new(&mut handle).poll(&mut cx) {
            Poll::Ready(Ok(output)) => return output,
            Poll::Ready(Err(err)) => match err.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(err) => panic!("`sync_wait` future did not complete: {err}"),
            },
            Poll::Pending => {
                event.wait();
                // A wake landing after this reset is still seen by the next poll.
                event.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::test_utils::*;
    use anyhow::Result;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("custom: {0}")]
    struct CustomError(&'static str);

    #[test]
    fn test_returns_value() {
        assert_eq!(sync_wait(async { 7 }), 7);
        assert_eq!(sync_wait(Task::ready("done")), "done");
    }

    #[test]
    fn test_propagates_typed_error() {
        let res: Result<u32, CustomError> = sync_wait(async { Err(CustomError("x")) });
        assert_eq!(res, Err(CustomError("x")));
    }

    #[test]
    fn test_resumes_panic_payload() {
        let res = catch_unwind(AssertUnwindSafe(|| {
            sync_wait(Task::<u32>::new(async { panic!("boom") }))
        }));

        let payload = res.expect_err("sync_wait should re-raise");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn test_waits_for_foreign_wake() -> Result<()> {
        let gate = Arc::new(ManualResetEvent::new(false));
        let (tx, rx) = futures::channel::oneshot::channel::<u32>();

        let opener = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(10));
                let _ = tx.send(5);
            })
        };

        gate.set();
        assert_eq!(sync_wait(rx)?, 5);
        opener.join().map_err(|_| anyhow::anyhow!("sender panicked"))?;
        Ok(())
    }

    #[test]
    fn test_hop_resumes_on_scheduler() {
        let runtime = init_runtime(None);
        let handle = runtime.handle().clone();

        let on_worker = sync_wait(async move {
            handle.schedule().await;
            crate::runtime::current_thread_tag().contains(crate::runtime::ThreadTag::WORKER)
        });
        assert!(on_worker);
    }

    #[test]
    fn test_panics_inside_task() {
        let handle = spawn_with(
            async { catch_unwind(|| sync_wait(async {})).is_err() },
            None,
            Start::Inline,
        );
        assert!(sync_wait(handle).unwrap_or(false));
    }
}
