//! Buffered sequential streams, over files or bytes already in memory.

use crate::io::{AsyncFile, FileAccess, FileBuffering, FileOpenMode, IoError, IoHandle};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Size of the internal buffer of an [`AsyncStream`].
pub const STREAM_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Read,
    Write,
}

/// A file read or written front to back through a 4 KiB buffer.
///
/// Small reads are served from the buffer, refilled with one `read_at` per
/// block; reads spanning whole blocks bypass it. Writes accumulate in the
/// buffer and go out a block at a time. [`flush`](AsyncStream::flush) pushes
/// out the tail; a write stream dropped with buffered bytes writes them out
/// with a blocking `pwrite`.
///
/// Reading a write stream, or writing a read stream, fails with `EBADF`.
#[derive(Debug)]
pub struct AsyncStream {
    file: AsyncFile,
    mode: StreamMode,

    /// Read mode: the bytes of `[offset - buf.len(), offset)`.
    /// Write mode: bytes waiting to be written at `offset`.
    buf: Vec<u8>,

    /// Read cursor into `buf`, 0 in write mode.
    pos: usize,

    /// File offset of the next transfer.
    offset: u64,
}

impl AsyncStream {
    /// Read streams open an existing file. Write streams create the file,
    /// truncating it if it exists.
    pub fn open(
        io: &IoHandle,
        path: impl AsRef<Path>,
        mode: StreamMode,
        buffering: FileBuffering,
    ) -> Result<Self, IoError> {
        let (access, open_mode) = match mode {
            StreamMode::Read => (FileAccess::Read, FileOpenMode::OpenExisting),
            StreamMode::Write => (FileAccess::Write, FileOpenMode::CreateAlways),
        };

        let file = AsyncFile::open(io, path, access, open_mode, buffering)?;
        Ok(Self::from_file(file, mode))
    }

    /// Streams `file` from its start.
    pub fn from_file(file: AsyncFile, mode: StreamMode) -> Self {
        Self {
            file,
            mode,
            buf: Vec::with_capacity(STREAM_BUFFER_SIZE),
            pos: 0,
            offset: 0,
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Offset of the next byte read or written.
    pub fn position(&self) -> u64 {
        match self.mode {
            StreamMode::Read => self.offset - (self.buf.len() - self.pos) as u64,
            StreamMode::Write => self.offset + self.buf.len() as u64,
        }
    }

    /// Reads up to `dst.len()` bytes. Returns fewer only at end of file.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, IoError> {
        if self.mode != StreamMode::Read {
            return Err(IoError::from_errno(libc::EBADF));
        }

        let mut filled = self.copy_buffered(dst);
        while filled < dst.len() {
            let remaining = dst.len() - filled;

            if remaining >= STREAM_BUFFER_SIZE {
                // The buffer is drained here: whole blocks go straight to `dst`.
                let len = remaining - remaining % STREAM_BUFFER_SIZE;
                let (res, chunk) = self.file.read_at(vec![0; len], self.offset).await;
                let n = res?;
                if n == 0 {
                    break;
                }
                dst[filled..filled + n].copy_from_slice(&chunk);
                self.offset += n as u64;
                filled += n;
            } else {
                if self.fill_buffer().await? == 0 {
                    break;
                }
                filled += self.copy_buffered(&mut dst[filled..]);
            }
        }

        Ok(filled)
    }

    fn copy_buffered(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len() - self.pos);
        dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Replaces the drained buffer with the next block of the file.
    async fn fill_buffer(&mut self) -> Result<usize, IoError> {
        let mut buf = std::mem::take(&mut self.buf);
        self.pos = 0;
        buf.clear();
        buf.resize(STREAM_BUFFER_SIZE, 0);

        let (res, buf) = self.file.read_at(buf, self.offset).await;
        self.buf = buf;
        match res {
            Ok(n) => {
                self.offset += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    /// Writes all of `src`, through the buffer. Returns `src.len()`.
    pub async fn write(&mut self, src: &[u8]) -> Result<usize, IoError> {
        if self.mode != StreamMode::Write {
            return Err(IoError::from_errno(libc::EBADF));
        }

        let mut written = 0;
        while written < src.len() {
            let remaining = src.len() - written;

            if self.buf.is_empty() && remaining >= STREAM_BUFFER_SIZE {
                let len = remaining - remaining % STREAM_BUFFER_SIZE;
                let chunk = src[written..written + len].to_vec();
                self.file.write_all_at(chunk, self.offset).await?;
                self.offset += len as u64;
                written += len;
                continue;
            }

            let n = remaining.min(STREAM_BUFFER_SIZE - self.buf.len());
            self.buf.extend_from_slice(&src[written..written + n]);
            written += n;

            if self.buf.len() == STREAM_BUFFER_SIZE {
                self.flush().await?;
            }
        }

        Ok(written)
    }

    /// Writes out the buffered bytes. No-op on read streams.
    ///
    /// The bytes stay buffered until the write succeeds, so a failed or
    /// dropped flush can be retried.
    pub async fn flush(&mut self) -> Result<(), IoError> {
        if self.mode != StreamMode::Write || self.buf.is_empty() {
            return Ok(());
        }

        self.file.write_all_at(self.buf.clone(), self.offset).await?;
        self.offset += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Moves the cursor `n` bytes forward. On a write stream the skipped
    /// range is left as a hole.
    pub async fn skip(&mut self, n: u64) -> Result<(), IoError> {
        if n == 0 {
            return Ok(());
        }
        self.skip_to(self.position().saturating_add(n)).await
    }

    /// Moves the cursor to `offset`. Write streams flush first.
    pub async fn skip_to(&mut self, offset: u64) -> Result<(), IoError> {
        match self.mode {
            StreamMode::Read => {
                let start = self.offset - self.buf.len() as u64;
                if (start..=self.offset).contains(&offset) {
                    self.pos = (offset - start) as usize;
                } else {
                    self.buf.clear();
                    self.pos = 0;
                    self.offset = offset;
                }
            }
            StreamMode::Write => {
                self.flush().await?;
                self.offset = offset;
            }
        }
        Ok(())
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        if self.mode != StreamMode::Write || self.buf.is_empty() {
            return;
        }

        if let Err(e) = self.file.std_file().write_all_at(&self.buf, self.offset) {
            tracing::warn!(error = %e, len = self.buf.len(), "failed to write stream tail on drop");
        }
    }
}

/// A read stream over bytes already in memory, with the same cursor
/// operations as a read [`AsyncStream`].
#[derive(Debug, Clone)]
pub struct MemoryStream<B> {
    data: B,
    pos: usize,
}

impl<B: AsRef<[u8]>> MemoryStream<B> {
    pub fn new(data: B) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.data.as_ref().len() - self.pos
    }

    /// Copies up to `dst.len()` bytes. Returns fewer at the end of the data.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, IoError> {
        let data = &self.data.as_ref()[self.pos..];
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
        self.pos += n;
        Ok(n)
    }

    /// Moves the cursor forward, stopping at the end of the data.
    pub fn skip(&mut self, n: u64) {
        self.skip_to(self.position().saturating_add(n));
    }

    /// Moves the cursor to `offset`, clamped to the end of the data.
    pub fn skip_to(&mut self, offset: u64) {
        let len = self.data.as_ref().len();
        self.pos = usize::try_from(offset).map_or(len, |offset| offset.min(len));
    }

    pub fn into_inner(self) -> B {
        self.data
    }
}
