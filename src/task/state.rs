use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The runnable was woken and must be (re)polled.
const NOTIFIED: usize = 0b0001;

/// A thread is currently polling the future.
const RUNNING: usize = 0b0010;

/// The future finished or was dropped; terminal.
const COMPLETE: usize = 0b0100;

/// Cancellation was requested while the future was being polled.
const CANCELLED: usize = 0b1000;

/// Atomic state word of a [`RawTask`](super::RawTask).
///
/// A runnable is polled by at most one thread at a time. A wake that lands
/// while the runnable is running only records `NOTIFIED`; the polling thread
/// dispatches it again once its poll returns, so every wake results in exactly
/// one more poll and never in two concurrent ones.
pub(crate) struct State(AtomicUsize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToIdle {
    /// Nothing happened during the poll.
    Idle,
    /// Woken during the poll, must be dispatched again.
    Notified,
    /// Cancelled during the poll, the future must be dropped.
    Cancelled,
}

impl State {
    /// New runnables start notified: their first dispatch polls them.
    pub(crate) fn new() -> Self {
        State(AtomicUsize::new(NOTIFIED))
    }

    /// Called on wake. Returns true if the caller must dispatch the runnable.
    pub(crate) fn transition_to_notified(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur & (COMPLETE | NOTIFIED) != 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                cur,
                cur | NOTIFIED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur & RUNNING == 0,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Claims the right to poll. Fails if the runnable is complete, already
    /// running, or was not notified.
    pub(crate) fn transition_to_running(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur & (RUNNING | COMPLETE) != 0 || cur & NOTIFIED == 0 {
                return false;
            }

            let next = (cur & !NOTIFIED) | RUNNING;
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Releases the poll right after the future returned `Pending`.
    pub(crate) fn transition_to_idle(&self) -> TransitionToIdle {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            debug_assert!(cur & RUNNING != 0, "runnable was not running");

            if cur & CANCELLED != 0 {
                self.0.store(COMPLETE, Ordering::Release);
                return TransitionToIdle::Cancelled;
            }

            match self.0.compare_exchange_weak(
                cur,
                cur & !RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if cur & NOTIFIED != 0 => return TransitionToIdle::Notified,
                Ok(_) => return TransitionToIdle::Idle,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn transition_to_complete(&self) {
        self.0.store(COMPLETE, Ordering::Release);
    }

    /// Requests cancellation. Returns true if the caller now owns the future
    /// and must drop it. If the runnable is running, cancellation is deferred
    /// to the polling thread.
    pub(crate) fn transition_to_cancelled(&self) -> bool {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur & COMPLETE != 0 {
                return false;
            }

            let (next, owned) = if cur & RUNNING != 0 {
                (cur | CANCELLED, false)
            } else {
                (COMPLETE, true)
            };

            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return owned,
                Err(actual) => cur = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire) & COMPLETE != 0
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cur = self.0.load(Ordering::Relaxed);
        f.debug_struct("State")
            .field("notified", &(cur & NOTIFIED != 0))
            .field("running", &(cur & RUNNING != 0))
            .field("complete", &(cur & COMPLETE != 0))
            .field("cancelled", &(cur & CANCELLED != 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_while_running_defers_dispatch() {
        let state = State::new();
        assert!(state.transition_to_running());

        // Running: the waker must not dispatch, the poller will.
        assert!(!state.transition_to_notified());
        // A second wake is coalesced.
        assert!(!state.transition_to_notified());

        assert_eq!(state.transition_to_idle(), TransitionToIdle::Notified);
        assert!(state.transition_to_running());
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Idle);
    }

    #[test]
    fn test_wake_when_idle_dispatches_once() {
        let state = State::new();
        assert!(state.transition_to_running());
        assert_eq!(state.transition_to_idle(), TransitionToIdle::Idle);

        assert!(state.transition_to_notified());
        assert!(!state.transition_to_notified());
    }

    #[test]
    fn test_complete_is_terminal() {
        let state = State::new();
        assert!(state.transition_to_running());
        state.transition_to_complete();

        assert!(state.is_complete());
        assert!(!state.transition_to_notified());
        assert!(!state.transition_to_running());
        assert!(!state.transition_to_cancelled());
    }

    #[test]
    fn test_cancel_idle_and_running() {
        let idle = State::new();
        assert!(idle.transition_to_cancelled());
        assert!(idle.is_complete());

        let running = State::new();
        assert!(running.transition_to_running());
        assert!(!running.transition_to_cancelled());
        assert!(!running.is_complete());
        assert_eq!(running.transition_to_idle(), TransitionToIdle::Cancelled);
        assert!(running.is_complete());
    }
}
