use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Number of polls of the flag before a waiter falls back to the condvar.
const SPIN_LIMIT: u32 = 64;

/// A latch that releases every waiter once set, and stays set until
/// [`reset`](ManualResetEvent::reset) is called.
#[derive(Debug, Default)]
pub struct ManualResetEvent {
    // Fast path for `is_set` and spinning. Only written while holding `lock`.
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            flag: AtomicBool::new(initially_set),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Sets the event and wakes every blocked waiter.
    pub fn set(&self) {
        let _guard = self.lock.lock();
        self.flag.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        let _guard = self.lock.lock();
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the event is set.
    pub fn wait(&self) {
        if self.spin() {
            return;
        }

        let mut guard = self.lock.lock();
        while !self.flag.load(Ordering::Acquire) {
            self.cond.wait(&mut guard);
        }
    }

    /// Blocks until the event is set or `timeout` elapses. Returns whether the
    /// event was observed set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.spin() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !self.flag.load(Ordering::Acquire) {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.flag.load(Ordering::Acquire);
            }
        }

        true
    }

    fn spin(&self) -> bool {
        for _ in 0..SPIN_LIMIT {
            if self.is_set() {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    assert_impl_all!(ManualResetEvent: Send, Sync);

    #[test]
    fn test_set_releases_all_waiters() -> Result<()> {
        let event = Arc::new(ManualResetEvent::new(false));
        let released = Arc::new(AtomicUsize::new(0));

        let handles = (0..4)
            .map(|_| {
                let event = Arc::clone(&event);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    event.wait();
                    released.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::Relaxed), 0);

        event.set();
        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("waiter panicked"))?;
        }

        assert_eq!(released.load(Ordering::Relaxed), 4);
        Ok(())
    }

    #[test]
    fn test_stays_set_until_reset() {
        let event = ManualResetEvent::new(true);
        event.wait();
        event.wait();
        assert!(event.is_set());

        event.reset();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_timeout_observes_late_set() -> Result<()> {
        let event = Arc::new(ManualResetEvent::default());
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event.set();
            })
        };

        assert!(event.wait_timeout(Duration::from_secs(5)));
        setter.join().map_err(|_| anyhow::anyhow!("setter panicked"))?;
        Ok(())
    }
}
