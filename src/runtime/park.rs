use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// Parking lot for the threads of one scheduler, plus its shutdown flag.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    shutdown: AtomicBool,

    /// LIFO collection of parked threads. We unpark in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hottest.
    parked_threads: Mutex<VecDeque<(Thread, Arc<AtomicBool>)>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sets the shutdown flag and wakes every parked thread so it can observe
    /// it. Returns false if shutdown was already signalled.
    pub(crate) fn signal_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        self.unpark_all_threads();
        first
    }

    /// Parks the current thread until another thread unparks it.
    ///
    /// `has_work` and the shutdown flag are checked *while holding the lock*:
    /// a producer that pushes work and then calls `unpark_one_thread` either
    /// sees this thread in the list or happened before the check.
    pub(crate) fn park_current_thread(&self, unpark: &Arc<AtomicBool>, has_work: impl Fn() -> bool) {
        {
            let mut parked_threads = self.parked_threads.lock();

            if has_work() || self.is_shutdown() {
                return;
            }

            unpark.store(false, Ordering::Release);
            parked_threads.push_back((thread::current(), Arc::clone(unpark)));
        }

        // Spurious wakeups are possible, loop until explicitly unparked.
        while !unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        let parked = self.parked_threads.lock().pop_back();

        match parked {
            Some((thread, unpark)) => {
                unpark.store(true, Ordering::Release);
                thread.unpark();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let parked = std::mem::take(&mut *self.parked_threads.lock());
        let num_unparked = parked.len();

        for (thread, unpark) in parked {
            unpark.store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    #[cfg(test)]
    pub(crate) fn num_parked(&self) -> usize {
        self.parked_threads.lock().len()
    }
}
