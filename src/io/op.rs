use crate::io::scheduler::{TransferKind, TransferRequest};
use crate::io::{IoError, IoHandle};
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Offset meaning "the file's current position", for pipes and other
/// non-seekable descriptors.
pub const CURRENT_POSITION: u64 = u64::MAX;

/// Output of a read or write: the transferred byte count, and the buffer
/// handed back to the caller. After a read, the buffer is truncated to the
/// bytes actually read.
pub type BufResult = (Result<usize, IoError>, Vec<u8>);

enum State {
    Initial { file: Arc<File>, buf: Vec<u8> },
    Submitted { key: usize },
    Done,
}

/// A read or write on a file, driven by the io scheduler.
///
/// The operation first tries to complete synchronously, with
/// `preadv2`/`pwritev2(RWF_NOWAIT)`: data already in the page cache never
/// goes through the ring. Otherwise it is submitted and the task suspends
/// until an io thread reaps the completion.
///
/// Dropping the future while the kernel owns the buffer cancels the request
/// (`IORING_OP_ASYNC_CANCEL`). The buffer is freed once the kernel is done
/// with it.
#[must_use = "futures do nothing unless awaited"]
pub struct FileOp {
    io: IoHandle,
    kind: TransferKind,
    offset: u64,
    state: State,
}

/// A positional read, see [`AsyncFile::read_at`](crate::io::AsyncFile::read_at).
pub type ReadAt = FileOp;

/// A positional write, see [`AsyncFile::write_at`](crate::io::AsyncFile::write_at).
pub type WriteAt = FileOp;

impl FileOp {
    pub(crate) fn read(io: IoHandle, file: Arc<File>, buf: Vec<u8>, offset: u64) -> ReadAt {
        FileOp::new(io, TransferKind::Read, file, buf, offset)
    }

    pub(crate) fn write(io: IoHandle, file: Arc<File>, buf: Vec<u8>, offset: u64) -> WriteAt {
        FileOp::new(io, TransferKind::Write, file, buf, offset)
    }

    fn new(io: IoHandle, kind: TransferKind, file: Arc<File>, buf: Vec<u8>, offset: u64) -> Self {
        FileOp {
            io,
            kind,
            offset,
            state: State::Initial { file, buf },
        }
    }

    fn finish(&self, res: i32, mut buf: Vec<u8>) -> BufResult {
        if res < 0 {
            return (Err(IoError::from_errno(-res)), buf);
        }

        let n = res as usize;
        if self.kind == TransferKind::Read {
            buf.truncate(n);
        }
        (Ok(n), buf)
    }
}

impl Future for FileOp {
    type Output = BufResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BufResult> {
        let this = &mut *self;

        match std::mem::replace(&mut this.state, State::Done) {
            State::Initial { file, mut buf } => {
                match try_nowait(this.kind, &file, &mut buf, this.offset) {
                    NoWait::Done(res) => return Poll::Ready(this.finish(res, buf)),
                    NoWait::WouldBlock => {}
                }

                let req = TransferRequest {
                    kind: this.kind,
                    fd: file.as_raw_fd(),
                    file: Arc::clone(&file),
                    buf,
                    offset: this.offset,
                };

                match this.io.submit_transfer(req, cx.waker()) {
                    Ok(key) => {
                        this.state = State::Submitted { key };
                        Poll::Pending
                    }
                    Err((e, buf)) if e.is_retryable() => {
                        // Polled again once the event loop frees up room.
                        this.io.register_retry(cx.waker());
                        this.state = State::Initial { file, buf };
                        Poll::Pending
                    }
                    Err((e, buf)) => Poll::Ready((Err(e), buf)),
                }
            }
            State::Submitted { key } => match this.io.poll_transfer(key, cx.waker()) {
                Poll::Ready((res, buf)) => Poll::Ready(this.finish(res, buf)),
                Poll::Pending => {
                    this.state = State::Submitted { key };
                    Poll::Pending
                }
            },
            State::Done => panic!("`FileOp` polled after completion"),
        }
    }
}

impl Drop for FileOp {
    fn drop(&mut self) {
        if let State::Submitted { key } = self.state {
            self.io.cancel_transfer(key);
        }
    }
}

impl fmt::Debug for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Initial { .. } => "initial",
            State::Submitted { .. } => "submitted",
            State::Done => "done",
        };
        f.debug_struct("FileOp")
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("state", &state)
            .finish()
    }
}

enum NoWait {
    Done(i32),
    WouldBlock,
}

/// Attempts the transfer without blocking. Errors that only mean "not
/// supported here" fall back to the ring, which reports real errors itself.
fn try_nowait(kind: TransferKind, file: &File, buf: &mut [u8], offset: u64) -> NoWait {
    if buf.is_empty() {
        return NoWait::Done(0);
    }

    let iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let fd = file.as_raw_fd();
    let offset = offset as libc::off_t;

    // Safety: `iov` points into `buf`, which outlives the call.
    let res = unsafe {
        match kind {
            TransferKind::Read => libc::preadv2(fd, &iov, 1, offset, libc::RWF_NOWAIT),
            TransferKind::Write => libc::pwritev2(fd, &iov, 1, offset, libc::RWF_NOWAIT),
        }
    };

    if res >= 0 {
        return NoWait::Done(res.min(i32::MAX as isize) as i32);
    }

    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    match errno {
        libc::EAGAIN | libc::EOPNOTSUPP | libc::ENOSYS | libc::EINVAL => NoWait::WouldBlock,
        errno => NoWait::Done(-errno),
    }
}
