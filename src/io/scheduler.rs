use crate::context;
use crate::io::IoError;
use crate::io::ring::{Reaped, SharedRing};
use crate::io::slab::{Completion, Dispatch, OpSlab, Transfer};
use crate::runtime::{ReadyQueue, RuntimeConfig, Schedule, ScheduleOn, ThreadTag};
use crate::task::Runnable;
use crate::utils::ScopeGuard;
use anyhow::{Result, anyhow};
use io_uring::opcode;
use io_uring::squeue::Entry;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// Set in `thread_state` once `stop()` was called.
const STOP_REQUESTED: u32 = 1;

/// Increment of `thread_state` per thread inside `process_events`.
const ACTIVE_THREAD: u32 = 2;

/// `user_data` of the NOPs posted to release threads blocked in the kernel.
pub(crate) const WAKE_USER_DATA: u64 = u64::MAX;

/// `user_data` of `IORING_OP_ASYNC_CANCEL` requests.
pub(crate) const CANCEL_USER_DATA: u64 = u64::MAX - 1;

/// How long shutdown waits for cancelled transfers to complete.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read or write, with everything the SQE points to.
pub(crate) struct TransferRequest {
    pub(crate) kind: TransferKind,
    pub(crate) file: Arc<File>,
    pub(crate) fd: i32,
    pub(crate) buf: Vec<u8>,
    pub(crate) offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferKind {
    Read,
    Write,
}

/// Bridges task suspension to io_uring.
///
/// Any number of threads may drive the scheduler through
/// [`process_events`](IoScheduler::process_events). A `schedule()` hop posts a
/// NOP whose completion resumes the task on whichever thread reaps it, with no
/// affinity to the submitter.
///
/// Submissions that cannot be posted (full ring or slab) are never dropped:
/// they go to a lock-free overflow list that the next pass through the event
/// loop retries.
pub struct IoScheduler {
    ring: SharedRing,

    /// Guards pushes onto the SQ and the slab of in-flight operations.
    submission: Mutex<OpSlab>,

    /// Guards reaping the CQ.
    completion: Mutex<()>,

    overflow: ReadyQueue<Runnable>,

    /// `STOP_REQUESTED` bit plus `ACTIVE_THREAD` per thread in `process_events`.
    thread_state: AtomicU32,

    closed: AtomicBool,

    poll_interval: Duration,
}

/// Shared handle to an [`IoScheduler`].
#[derive(Clone)]
pub struct IoHandle(Arc<IoScheduler>);

impl Deref for IoHandle {
    type Target = IoScheduler;

    fn deref(&self) -> &IoScheduler {
        &self.0
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl IoHandle {
    /// Awaitable that resumes the current task on an io thread.
    pub fn schedule(&self) -> ScheduleOn {
        ScheduleOn::new(self.scheduler())
    }

    pub(crate) fn scheduler(&self) -> Arc<dyn Schedule> {
        Arc::clone(&self.0) as Arc<dyn Schedule>
    }
}

impl IoScheduler {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Result<IoHandle> {
        let ring = SharedRing::try_new(cfg).map_err(|e| anyhow!("failed to set up io_uring: {e}"))?;

        Ok(IoHandle(Arc::new(IoScheduler {
            ring,
            submission: Mutex::new(OpSlab::new(cfg.io_slab_size())),
            completion: Mutex::new(()),
            overflow: ReadyQueue::new(),
            thread_state: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            poll_interval: cfg.io_poll_interval,
        })))
    }

    /// Runs the event loop on the calling thread until [`stop`] is called.
    ///
    /// Returns immediately if stop was already requested.
    ///
    /// [`stop`]: IoScheduler::stop
    pub fn process_events(&self) {
        if !self.try_enter() {
            return;
        }

        let prev = context::add_thread_tag(ThreadTag::IO);
        let _guard = ScopeGuard::new(|| {
            context::set_thread_tag(prev);
            self.exit();
        });

        while !self.is_stop_requested() {
            self.try_process_events(true);
        }
    }

    /// Dispatches whatever is ready without blocking. Returns the number of
    /// completions handled.
    pub fn process_pending_events(&self) -> usize {
        let prev = context::add_thread_tag(ThreadTag::IO);
        let _guard = ScopeGuard::new(|| context::set_thread_tag(prev));

        self.try_process_events(false)
    }

    /// Asks every thread in `process_events` to return, waking those blocked
    /// in the kernel.
    pub fn stop(&self) {
        let prev = self.thread_state.fetch_or(STOP_REQUESTED, Ordering::AcqRel);
        if prev & STOP_REQUESTED != 0 {
            return;
        }

        let active = prev / ACTIVE_THREAD;
        tracing::debug!(active, "io scheduler stop requested");

        {
            let _slab = self.submission.lock();
            for _ in 0..active {
                let wake = opcode::Nop::new().build().user_data(WAKE_USER_DATA);
                // Safety: submission lock held, the NOP references no memory.
                if unsafe { self.ring.push(&wake) }.is_err() {
                    // A full ring means completions are coming anyway.
                    break;
                }
            }
        }

        if let Err(e) = self.ring.submit() {
            tracing::warn!(error = %e, "failed to submit wake-up events");
        }
    }

    /// Clears a previous stop request so `process_events` can run again.
    pub fn reset(&self) {
        self.thread_state
            .fetch_and(!STOP_REQUESTED, Ordering::AcqRel);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.thread_state.load(Ordering::Acquire) & STOP_REQUESTED != 0
    }

    fn try_enter(&self) -> bool {
        let mut cur = self.thread_state.load(Ordering::Acquire);
        loop {
            if cur & STOP_REQUESTED != 0 {
                return false;
            }

            match self.thread_state.compare_exchange_weak(
                cur,
                cur + ACTIVE_THREAD,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn exit(&self) {
        self.thread_state
            .fetch_sub(ACTIVE_THREAD, Ordering::AcqRel);
    }

    fn try_process_events(&self, wait: bool) -> usize {
        self.reschedule_overflow();

        let submitted = if wait {
            self.ring.submit_and_wait(1, self.poll_interval)
        } else {
            self.ring.submit()
        };
        if let Err(e) = submitted {
            tracing::warn!(error = %e, "io_uring submit failed");
        }

        self.reap_and_dispatch()
    }

    fn reap_and_dispatch(&self) -> usize {
        let mut reaped = Reaped::new();
        {
            let _cq = self.completion.lock();
            // Safety: completion lock held.
            unsafe { self.ring.reap(&mut reaped) };
        }

        if reaped.is_empty() {
            return 0;
        }

        let mut dispatch = SmallVec::<[Dispatch; 32]>::new();
        {
            let mut slab = self.submission.lock();
            for (user_data, res) in reaped.iter().copied() {
                match user_data {
                    WAKE_USER_DATA => {}
                    CANCEL_USER_DATA => {
                        if res < 0 && !matches!(-res, libc::ENOENT | libc::EALREADY) {
                            tracing::warn!(errno = -res, "io cancellation failed");
                        }
                    }
                    key => dispatch.extend(slab.on_completion(key as usize, res)),
                }
            }
        }

        tracing::trace!(reaped = reaped.len(), dispatched = dispatch.len(), "io completions");

        let closed = self.closed.load(Ordering::Acquire);
        for d in dispatch {
            match d {
                Dispatch::Run(runnable) if closed => runnable.cancel(),
                Dispatch::Run(runnable) => runnable.run(),
                Dispatch::Wake(waker) => waker.wake(),
            }
        }

        reaped.len()
    }

    /// Retries everything parked on the overflow list, in order. Whatever
    /// still does not fit goes back on the list.
    fn reschedule_overflow(&self) {
        if self.overflow.is_empty() {
            return;
        }

        let mut pending = self.overflow.drain();
        while let Some(runnable) = pending.next() {
            match runnable {
                // Retry registrations and foreign `schedule()` callers are
                // woken from this thread directly.
                Runnable::Waker(waker) => waker.wake(),
                Runnable::Task(_) => {
                    if let Err(runnable) = self.try_post(runnable) {
                        self.overflow.push(runnable);
                        pending.for_each(|r| {
                            self.overflow.push(r);
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Posts a NOP that resumes `runnable` once reaped.
    fn try_post(&self, runnable: Runnable) -> Result<(), Runnable> {
        {
            let mut slab = self.submission.lock();
            let Ok(reserved) = slab.reserve_entry() else {
                return Err(runnable);
            };

            let nop = opcode::Nop::new().build().user_data(reserved.key() as u64);
            if self.push_or_flush(&nop).is_err() {
                return Err(runnable);
            }

            reserved.commit(Completion::Resume(runnable));
        }

        if let Err(e) = self.ring.submit() {
            tracing::warn!(error = %e, "io_uring submit failed");
        }
        Ok(())
    }

    /// Pushes `entry`, flushing the SQ once if it is full.
    ///
    /// Must be called with the submission lock held.
    fn push_or_flush(&self, entry: &Entry) -> Result<(), IoError> {
        // Safety: the caller holds the submission lock; `entry` only points into
        // memory owned by its slab slot.
        match unsafe { self.ring.push(entry) } {
            Err(IoError::SqRingFull(_)) => {
                self.ring.submit()?;
                unsafe { self.ring.push(entry) }
            }
            res => res,
        }
    }

    /// Submits a read or write. On success the slot owns the buffer until the
    /// kernel completes it.
    pub(crate) fn submit_transfer(
        &self,
        req: TransferRequest,
        waker: &Waker,
    ) -> Result<usize, (IoError, Vec<u8>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((IoError::Stopped, req.buf));
        }

        let key = {
            let mut slab = self.submission.lock();
            let reserved = match slab.reserve_entry() {
                Ok(reserved) => reserved,
                Err(e) => return Err((e, req.buf)),
            };
            let key = reserved.key();

            let TransferRequest {
                kind,
                file,
                fd,
                mut buf,
                offset,
            } = req;

            let fd = io_uring::types::Fd(fd);
            let len = buf.len().min(u32::MAX as usize) as u32;
            let entry = match kind {
                TransferKind::Read => opcode::Read::new(fd, buf.as_mut_ptr(), len)
                    .offset(offset)
                    .build(),
                TransferKind::Write => opcode::Write::new(fd, buf.as_ptr(), len)
                    .offset(offset)
                    .build(),
            }
            .user_data(key as u64);

            if let Err(e) = self.push_or_flush(&entry) {
                return Err((e, buf));
            }

            // Moving the Vec does not move its heap buffer.
            reserved.commit(Completion::Transfer(Transfer {
                _file: file,
                buf,
                waker: Some(waker.clone()),
                result: None,
                orphaned: false,
            }));
            key
        };

        if let Err(e) = self.ring.submit() {
            tracing::warn!(error = %e, "io_uring submit failed");
        }
        Ok(key)
    }

    /// Takes the result of transfer `key` if the kernel completed it, else
    /// refreshes its waker.
    pub(crate) fn poll_transfer(&self, key: usize, waker: &Waker) -> Poll<(i32, Vec<u8>)> {
        let mut slab = self.submission.lock();

        let Some(transfer) = slab.transfer_mut(key) else {
            // The slot is owned by the future until it observes the result.
            return Poll::Ready((-libc::ECANCELED, Vec::new()));
        };

        if transfer.result.is_none() {
            match &transfer.waker {
                Some(w) if w.will_wake(waker) => {}
                _ => transfer.waker = Some(waker.clone()),
            }
            return Poll::Pending;
        }

        match slab.remove(key) {
            Some(Completion::Transfer(t)) => Poll::Ready((t.result.unwrap_or(-libc::ECANCELED), t.buf)),
            _ => Poll::Ready((-libc::ECANCELED, Vec::new())),
        }
    }

    /// Called when the future awaiting transfer `key` is dropped. Asks the
    /// kernel to cancel it; the slot, fd and buffer are released only once the
    /// original completion arrives.
    pub(crate) fn cancel_transfer(&self, key: usize) {
        {
            let mut slab = self.submission.lock();
            let Some(transfer) = slab.transfer_mut(key) else {
                return;
            };

            if transfer.result.is_some() {
                slab.remove(key);
                return;
            }

            transfer.orphaned = true;
            transfer.waker = None;

            let cancel = opcode::AsyncCancel::new(key as u64)
                .build()
                .user_data(CANCEL_USER_DATA);
            if let Err(e) = self.push_or_flush(&cancel) {
                tracing::warn!(key, error = %e, "failed to push io cancellation");
            }
        }

        if let Err(e) = self.ring.submit() {
            tracing::warn!(key, error = %e, "failed to submit io cancellation");
        }
    }

    /// Parks a waker on the overflow list, to be woken on the next pass
    /// through the event loop. Used when a submission hit a full ring or slab.
    pub(crate) fn register_retry(&self, waker: &Waker) {
        self.overflow.push(Runnable::Waker(waker.clone()));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of operations currently owned by the kernel.
    pub fn in_flight(&self) -> usize {
        self.submission.lock().len()
    }

    /// Closes the scheduler: cancels in-flight transfers and waits for their
    /// completions so no buffer is released while the kernel may write to it.
    /// Queued `schedule()` hops are cancelled.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop();

        let keys = self.submission.lock().in_flight_transfers();
        if !keys.is_empty() {
            let _slab = self.submission.lock();
            for key in &keys {
                let cancel = opcode::AsyncCancel::new(*key as u64)
                    .build()
                    .user_data(CANCEL_USER_DATA);
                if let Err(e) = self.push_or_flush(&cancel) {
                    tracing::warn!(key, error = %e, "failed to push io cancellation");
                }
            }
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            self.overflow.drain().for_each(Runnable::cancel);
            self.try_process_events(false);

            if self.submission.lock().in_flight_transfers().is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "{} io operation(s) still in flight after shutdown",
                    self.submission.lock().in_flight_transfers().len()
                ));
            }
            let _ = self.ring.submit_and_wait(1, Duration::from_millis(10));
        }

        let resumes = self.submission.lock().take_resumes();
        let cancelled = resumes.into_iter().map(Runnable::cancel).count();
        tracing::debug!(cancelled_transfers = keys.len(), cancelled, "io scheduler shut down");
        Ok(())
    }
}

impl Schedule for IoScheduler {
    fn schedule(&self, runnable: Runnable) {
        if self.closed.load(Ordering::Acquire) {
            runnable.cancel();
            return;
        }

        if let Err(runnable) = self.try_post(runnable) {
            tracing::trace!("io submission overflow");
            self.overflow.push(runnable);
        }
    }

    fn thread_tag(&self) -> ThreadTag {
        ThreadTag::IO
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        let leaked = self.submission.get_mut().forget_in_flight();
        if leaked > 0 {
            tracing::warn!(leaked, "leaking buffers of io still in flight");
        }
    }
}

impl fmt::Debug for IoScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoScheduler")
            .field("stop_requested", &self.is_stop_requested())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
