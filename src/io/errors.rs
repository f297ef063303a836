use io_uring::squeue::PushError;
use std::io::{self, Error};

/// Errors surfaced by io scheduler operations.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission queue ring for io_uring is full.
    /// This is a recoverable state: completions must be reaped before more
    /// io can be submitted.
    #[error("Submission queue ring is full, cannot submit IO")]
    SqRingFull(#[from] PushError),

    /// Every in-flight operation slot is taken.
    #[error("Slab allocator is full, cannot allocate new resource")]
    SlabFull,

    /// The io scheduler was shut down.
    #[error("IO scheduler is shut down")]
    Stopped,

    /// An I/O error occurred. Kernel errors carry their errno.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl IoError {
    pub(crate) fn from_errno(errno: i32) -> Self {
        IoError::Io(Error::from_raw_os_error(errno))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IoError::SlabFull => true,
            IoError::SqRingFull { .. } => true,
            IoError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EBUSY | libc::EINTR)),
            _ => false,
        }
    }

    /// The OS error code, for errors reported by the kernel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqRingFull { .. }, Self::SqRingFull { .. }) => true,
            (Self::SlabFull, Self::SlabFull) => true,
            (Self::Stopped, Self::Stopped) => true,
            (Self::Io(a), Self::Io(b)) => match (a.raw_os_error(), b.raw_os_error()) {
                (Some(a), Some(b)) => a == b,
                _ => a.kind() == b.kind(),
            },
            _ => false,
        }
    }
}

impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(io_err) => io_err,
            _ => Error::other(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(IoError: Send, Sync, std::error::Error);

    #[rstest]
    #[case::slab_full(IoError::SlabFull, true)]
    #[case::eagain(IoError::from_errno(libc::EAGAIN), true)]
    #[case::ebadf(IoError::from_errno(libc::EBADF), false)]
    #[case::stopped(IoError::Stopped, false)]
    #[case::other(IoError::Other(anyhow::anyhow!("boom")), false)]
    fn test_is_retryable(#[case] err: IoError, #[case] expected: bool) {
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn test_errno_round_trips_to_std() {
        let err = IoError::from_errno(libc::ENOENT);
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(err, IoError::from_errno(libc::ENOENT));
        assert_ne!(err, IoError::from_errno(libc::EBADF));

        let std_err: io::Error = err.into();
        assert_eq!(std_err.kind(), io::ErrorKind::NotFound);
    }
}
