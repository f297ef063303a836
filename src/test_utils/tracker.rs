use crate::runtime::{Schedule, ThreadTag};
use crate::task::{Id, Runnable};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    /// `id` is `None` for a bare waker.
    Schedule { id: Option<Id> },
}

/// Records calls per method.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    calls: DashMap<Method, Vec<Call>>,
}

impl Tracker {
    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls.entry(method).or_default().push(call);
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}

/// A scheduler that queues runnables until the test drives them, recording
/// every call.
#[derive(Debug, Default)]
pub(crate) struct TrackingScheduler {
    pub(crate) tracker: Tracker,
    queue: Mutex<VecDeque<Runnable>>,
}

impl TrackingScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs the runnables queued so far and returns how many ran. Runnables
    /// they reschedule stay queued for the next call.
    pub(crate) fn run_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.queue.lock());
        let n = pending.len();
        for runnable in pending {
            runnable.run();
        }
        n
    }

    /// Cancels the runnables queued so far, as a shutdown would.
    pub(crate) fn cancel_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.queue.lock());
        let n = pending.len();
        for runnable in pending {
            runnable.cancel();
        }
        n
    }
}

impl Schedule for TrackingScheduler {
    fn schedule(&self, runnable: Runnable) {
        self.tracker.record(
            Method::Schedule,
            Call::Schedule {
                id: runnable.id(),
            },
        );
        self.queue.lock().push_back(runnable);
    }

    fn thread_tag(&self) -> ThreadTag {
        ThreadTag::WORKER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Start, spawn_with};
    use std::sync::Arc;

    #[test]
    fn test_records_task_ids() {
        let scheduler = Arc::new(TrackingScheduler::new());
        let handle = spawn_with(
            async {},
            Some(scheduler.clone() as Arc<dyn Schedule>),
            Start::Dispatch,
        );

        assert_eq!(
            scheduler.tracker.get_calls(&Method::Schedule),
            vec![Call::Schedule {
                id: Some(handle.id())
            }]
        );
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.run_pending(), 0);
    }
}
