use crate::io::IoError;
use crate::runtime::RuntimeConfig;
use io_uring::squeue::Entry;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::IoUring;
use smallvec::SmallVec;
use std::io;
use std::time::Duration;

// Completions reaped per pass are collected on the stack first.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 32;

pub(crate) type Reaped = SmallVec<[(u64, i32); SPILL_TO_HEAP_THRESHOLD]>;

/// An `io_uring` instance shared by every thread driving the io scheduler.
///
/// Unlike a single-issuer ring, any thread may push, submit and reap. The
/// caller serialises access to each side: pushes under one lock, reaping under
/// another. Waiting for completions needs neither, so a thread blocked in the
/// kernel never holds up submitters.
pub(crate) struct SharedRing {
    ring: IoUring,
}

impl SharedRing {
    pub(crate) fn try_new(cfg: &RuntimeConfig) -> io::Result<Self> {
        let ring = IoUring::builder()
            // Keep submitting requests even if one of them fails inline, so
            // every SQE produces a CQE.
            .setup_submit_all()
            .build(cfg.io_ring_size as u32)?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not enabled for this kernel. The kernel will silently drop completions if the CQ ring is full."
            );
        }

        Ok(SharedRing { ring })
    }

    /// Pushes one SQE without submitting it.
    ///
    /// # Safety
    ///
    /// The caller must hold the submission lock, and every buffer referenced by
    /// `entry` must stay valid until its completion is reaped.
    pub(crate) unsafe fn push(&self, entry: &Entry) -> Result<(), IoError> {
        let mut sq = unsafe { self.ring.submission_shared() };
        unsafe { sq.push(entry).map_err(IoError::from) }
    }

    /// # Safety
    ///
    /// The caller must hold the submission lock.
    #[cfg(test)]
    pub(crate) unsafe fn sq_is_full(&self) -> bool {
        unsafe { self.ring.submission_shared().is_full() }
    }

    /// Submits pending SQEs without waiting.
    pub(crate) fn submit(&self) -> io::Result<usize> {
        match self.ring.submitter().submit() {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Submits pending SQEs and blocks until `want` completions are ready or
    /// `timeout` elapses.
    pub(crate) fn submit_and_wait(&self, want: usize, timeout: Duration) -> io::Result<usize> {
        let ts = Timespec::from(timeout);
        let args = SubmitArgs::new().timespec(&ts);

        match self.ring.submitter().submit_with_args(want, &args) {
            Ok(n) => Ok(n),
            // Timing out is how idle threads get to re-check stop and overflow.
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(0),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Moves every ready CQE into `out` as `(user_data, result)`.
    ///
    /// # Safety
    ///
    /// The caller must hold the completion lock.
    pub(crate) unsafe fn reap(&self, out: &mut Reaped) -> usize {
        let cq = unsafe { self.ring.completion_shared() };
        let before = out.len();
        out.extend(cq.map(|cqe| (cqe.user_data(), cqe.result())));
        out.len() - before
    }
}

// Safety: the ring's shared memory is only touched through `push` and
// `reap`, whose callers serialise access per queue; `submitter()` only issues
// syscalls.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR | libc::EAGAIN | libc::EBUSY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use io_uring::opcode;

    #[test]
    fn test_nop_round_trip() -> Result<()> {
        let cfg = RuntimeConfig {
            io_ring_size: 4,
            ..RuntimeConfig::default()
        };
        let ring = SharedRing::try_new(&cfg)?;

        for i in 0..3 {
            unsafe { ring.push(&opcode::Nop::new().build().user_data(i))? };
        }
        ring.submit_and_wait(3, Duration::from_secs(1))?;

        let mut reaped = Reaped::new();
        let mut n = 0;
        while n < 3 {
            n += unsafe { ring.reap(&mut reaped) };
        }

        reaped.sort();
        assert_eq!(reaped.as_slice(), &[(0, 0), (1, 0), (2, 0)]);
        Ok(())
    }

    #[test]
    fn test_push_until_full() -> Result<()> {
        let cfg = RuntimeConfig {
            io_ring_size: 2,
            ..RuntimeConfig::default()
        };
        let ring = SharedRing::try_new(&cfg)?;

        unsafe {
            ring.push(&opcode::Nop::new().build())?;
            ring.push(&opcode::Nop::new().build())?;
            assert!(ring.sq_is_full());
            assert!(matches!(
                ring.push(&opcode::Nop::new().build()),
                Err(IoError::SqRingFull(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_wait_times_out_without_completions() -> Result<()> {
        let ring = SharedRing::try_new(&RuntimeConfig::default())?;
        assert_eq!(ring.submit_and_wait(1, Duration::from_millis(5))?, 0);
        Ok(())
    }
}
