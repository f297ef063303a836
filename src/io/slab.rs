use crate::io::IoError;
use crate::task::Runnable;
use slab::{Slab, VacantEntry};
use std::fs::File;
use std::sync::Arc;
use std::task::Waker;

/// What to do when the kernel posts the completion for a slot.
///
/// This is the per-request callback: a fixed-size value living in a
/// pre-allocated slab, so dispatching a completion never allocates.
pub(crate) enum Completion {
    /// A `schedule()` hop: run the runnable on the reaping thread.
    Resume(Runnable),

    /// A read or write. The slot owns everything the kernel may still touch.
    Transfer(Transfer),
}

pub(crate) struct Transfer {
    // Kept open until the kernel is done with the fd.
    pub(crate) _file: Arc<File>,
    pub(crate) buf: Vec<u8>,
    pub(crate) waker: Option<Waker>,
    pub(crate) result: Option<i32>,

    /// The awaiting future was dropped. The slot is freed by the completion.
    pub(crate) orphaned: bool,
}

/// Effect of a completion, applied once every lock is released.
pub(crate) enum Dispatch {
    Run(Runnable),
    Wake(Waker),
}

/// Slab of in-flight operations, keyed by the `user_data` of their SQE.
///
/// Insertion follows a reserve-commit pattern so a slot is only occupied if
/// the SQE was pushed successfully.
pub(crate) struct OpSlab {
    slab: Slab<Completion>,

    // `Slab::with_capacity` may round up; this is the hard limit.
    capacity: usize,
}

impl OpSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    /// Reserve a single slab entry for insertion. Insertion is a 2-step process
    /// where we first reserve the entry, but need to insert the entry to commit.
    pub(crate) fn reserve_entry(&mut self) -> Result<SlabReservedEntry<'_>, IoError> {
        if self.slab.len() >= self.capacity {
            return Err(IoError::SlabFull);
        }

        Ok(SlabReservedEntry {
            entry: self.slab.vacant_entry(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub(crate) fn transfer_mut(&mut self, key: usize) -> Option<&mut Transfer> {
        match self.slab.get_mut(key) {
            Some(Completion::Transfer(transfer)) => Some(transfer),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, key: usize) -> Option<Completion> {
        self.slab.try_remove(key)
    }

    /// Applies the kernel result `res` to slot `key`.
    pub(crate) fn on_completion(&mut self, key: usize, res: i32) -> Option<Dispatch> {
        match self.slab.get_mut(key) {
            Some(Completion::Resume(_)) => match self.slab.remove(key) {
                Completion::Resume(runnable) => Some(Dispatch::Run(runnable)),
                Completion::Transfer(_) => None,
            },
            Some(Completion::Transfer(transfer)) if transfer.orphaned => {
                tracing::trace!(key, res, "orphaned transfer completed");
                self.slab.remove(key);
                None
            }
            Some(Completion::Transfer(transfer)) => {
                transfer.result = Some(res);
                transfer.waker.take().map(Dispatch::Wake)
            }
            None => {
                tracing::warn!(key, res, "completion for unknown slab entry");
                None
            }
        }
    }

    /// Keys of transfers the kernel has not completed yet.
    pub(crate) fn in_flight_transfers(&self) -> Vec<usize> {
        self.slab
            .iter()
            .filter_map(|(key, c)| match c {
                Completion::Transfer(t) if t.result.is_none() => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Takes out every queued `schedule()` hop.
    pub(crate) fn take_resumes(&mut self) -> Vec<Runnable> {
        let keys = self
            .slab
            .iter()
            .filter_map(|(key, c)| matches!(c, Completion::Resume(_)).then_some(key))
            .collect::<Vec<_>>();

        keys.into_iter()
            .filter_map(|key| match self.slab.try_remove(key) {
                Some(Completion::Resume(runnable)) => Some(runnable),
                _ => None,
            })
            .collect()
    }

    /// Leaks the buffers of transfers the kernel may still write to.
    pub(crate) fn forget_in_flight(&mut self) -> usize {
        let mut leaked = 0;
        for (_, completion) in self.slab.iter_mut() {
            if let Completion::Transfer(t) = completion
                && t.result.is_none()
            {
                std::mem::forget(std::mem::take(&mut t.buf));
                leaked += 1;
            }
        }
        leaked
    }
}

/// A reserved, not yet occupied slot.
pub(crate) struct SlabReservedEntry<'a> {
    entry: VacantEntry<'a, Completion>,
}

impl<'a> SlabReservedEntry<'a> {
    /// Gets the key that will be used for the next insertion.
    pub(crate) fn key(&self) -> usize {
        self.entry.key()
    }

    pub(crate) fn commit(self, value: Completion) -> &'a mut Completion {
        self.entry.insert(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use anyhow::Result;

    fn transfer() -> Result<Completion> {
        Ok(Completion::Transfer(Transfer {
            _file: Arc::new(tempfile::tempfile()?),
            buf: vec![0; 8],
            waker: Some(mock_waker().0),
            result: None,
            orphaned: false,
        }))
    }

    #[test]
    fn test_reserve_respects_capacity() -> Result<()> {
        let mut slab = OpSlab::new(2);

        for _ in 0..2 {
            let reserved = slab.reserve_entry()?;
            reserved.commit(transfer()?);
        }

        assert!(matches!(slab.reserve_entry(), Err(IoError::SlabFull)));
        assert_eq!(slab.len(), 2);
        Ok(())
    }

    #[test]
    fn test_uncommitted_reservation_leaves_no_entry() -> Result<()> {
        let mut slab = OpSlab::new(1);
        {
            let reserved = slab.reserve_entry()?;
            assert_eq!(reserved.key(), 0);
        }
        assert!(slab.is_empty());
        Ok(())
    }

    #[test]
    fn test_transfer_completion_wakes_then_orphan_frees() -> Result<()> {
        let mut slab = OpSlab::new(4);
        let reserved = slab.reserve_entry()?;
        let key = reserved.key();
        reserved.commit(transfer()?);

        assert!(matches!(slab.on_completion(key, 8), Some(Dispatch::Wake(_))));
        assert_eq!(slab.transfer_mut(key).and_then(|t| t.result), Some(8));
        assert!(slab.in_flight_transfers().is_empty());

        let reserved = slab.reserve_entry()?;
        let orphan = reserved.key();
        reserved.commit(transfer()?);
        if let Some(t) = slab.transfer_mut(orphan) {
            t.orphaned = true;
        }
        assert_eq!(slab.in_flight_transfers(), vec![orphan]);

        assert!(slab.on_completion(orphan, -libc::ECANCELED).is_none());
        assert!(slab.transfer_mut(orphan).is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let mut slab = OpSlab::new(1);
        assert!(slab.on_completion(42, 0).is_none());
    }
}
