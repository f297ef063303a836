use crate::io::op::{FileOp, ReadAt, WriteAt};
use crate::io::{IoError, IoHandle};
use bitflags::bitflags;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

/// Chunk size used by [`AsyncFile::read_all`].
const READ_ALL_CHUNK: usize = 64 * 1024;

/// Which directions a file is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

/// What to do when the file does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenMode {
    /// Fails if the file does not exist.
    OpenExisting,

    /// Creates the file, truncating it if it exists.
    CreateAlways,

    /// Creates the file, failing if it exists.
    CreateNew,

    /// Opens the file, creating it if it does not exist.
    CreateOrOpen,

    /// Truncates an existing file, failing if it does not exist.
    TruncateExisting,
}

bitflags! {
    /// Hints about how the file will be accessed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileBuffering: u8 {
        /// `POSIX_FADV_SEQUENTIAL`
        const SEQUENTIAL = 1;

        /// `POSIX_FADV_RANDOM`
        const RANDOM_ACCESS = 1 << 1;

        /// Bypass the page cache (`O_DIRECT`). Buffers and offsets must then be
        /// aligned to the device's logical block size.
        const UNBUFFERED = 1 << 2;

        /// Writes return once the data is on stable storage (`O_DSYNC`).
        const WRITE_THROUGH = 1 << 3;
    }
}

impl FileBuffering {
    fn open_flags(self) -> libc::c_int {
        let mut flags = 0;
        if self.contains(FileBuffering::UNBUFFERED) {
            flags |= libc::O_DIRECT;
        }
        if self.contains(FileBuffering::WRITE_THROUGH) {
            flags |= libc::O_DSYNC;
        }
        flags
    }

    fn advice(self) -> Option<libc::c_int> {
        if self.contains(FileBuffering::SEQUENTIAL) {
            Some(libc::POSIX_FADV_SEQUENTIAL)
        } else if self.contains(FileBuffering::RANDOM_ACCESS) {
            Some(libc::POSIX_FADV_RANDOM)
        } else {
            None
        }
    }
}

/// A file whose reads and writes go through the io scheduler.
///
/// Opening, resizing and querying the size are plain blocking syscalls. Only
/// data transfers are asynchronous.
#[derive(Debug, Clone)]
pub struct AsyncFile {
    file: Arc<File>,
    io: IoHandle,
}

impl AsyncFile {
    pub fn open(
        io: &IoHandle,
        path: impl AsRef<Path>,
        access: FileAccess,
        mode: FileOpenMode,
        buffering: FileBuffering,
    ) -> Result<Self, IoError> {
        let mut opts = OpenOptions::new();
        match access {
            FileAccess::Read => opts.read(true),
            FileAccess::Write => opts.write(true),
            FileAccess::ReadWrite => opts.read(true).write(true),
        };

        match mode {
            FileOpenMode::OpenExisting => {}
            FileOpenMode::CreateAlways => {
                opts.create(true).truncate(true);
            }
            FileOpenMode::CreateNew => {
                opts.create_new(true);
            }
            FileOpenMode::CreateOrOpen => {
                opts.create(true);
            }
            FileOpenMode::TruncateExisting => {
                opts.truncate(true);
            }
        }

        let file = opts
            .custom_flags(buffering.open_flags())
            .mode(0o644)
            .open(path)?;

        if let Some(advice) = buffering.advice() {
            // Safety: `file` is an open descriptor.
            let res = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice) };
            if res != 0 {
                tracing::debug!(errno = res, "posix_fadvise failed, ignoring hint");
            }
        }

        Ok(Self::from_std(io, file))
    }

    /// Opens an existing file for reading.
    pub fn open_read(io: &IoHandle, path: impl AsRef<Path>) -> Result<Self, IoError> {
        Self::open(
            io,
            path,
            FileAccess::Read,
            FileOpenMode::OpenExisting,
            FileBuffering::empty(),
        )
    }

    /// Creates or truncates a file for writing.
    pub fn create(io: &IoHandle, path: impl AsRef<Path>) -> Result<Self, IoError> {
        Self::open(
            io,
            path,
            FileAccess::ReadWrite,
            FileOpenMode::CreateAlways,
            FileBuffering::empty(),
        )
    }

    pub fn from_std(io: &IoHandle, file: File) -> Self {
        Self {
            file: Arc::new(file),
            io: io.clone(),
        }
    }

    pub(crate) fn std_file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> Result<u64, IoError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> Result<(), IoError> {
        Ok(self.file.set_len(len)?)
    }

    /// Reads up to `buf.len()` bytes at `offset`. The returned buffer is
    /// truncated to the bytes read; an empty buffer means end of file.
    pub fn read_at(&self, buf: Vec<u8>, offset: u64) -> ReadAt {
        FileOp::read(self.io.clone(), Arc::clone(&self.file), buf, offset)
    }

    /// Writes `buf` at `offset`. The write may be short.
    pub fn write_at(&self, buf: Vec<u8>, offset: u64) -> WriteAt {
        FileOp::write(self.io.clone(), Arc::clone(&self.file), buf, offset)
    }

    /// Writes the whole of `buf` at `offset`, resubmitting short writes.
    pub async fn write_all_at(&self, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>, IoError> {
        let total = buf.len();
        let mut written = 0;

        while written < total {
            let chunk = buf.split_off(written);
            let (res, chunk) = self.write_at(chunk, offset + written as u64).await;
            buf.extend_from_slice(&chunk);

            match res? {
                0 => return Err(IoError::from_errno(libc::EIO)),
                n => written += n,
            }
        }
        Ok(buf)
    }

    /// Reads the file from the start until end of file.
    pub async fn read_all(&self) -> Result<Vec<u8>, IoError> {
        let mut out = Vec::with_capacity(self.size()? as usize);

        loop {
            let (res, chunk) = self
                .read_at(vec![0; READ_ALL_CHUNK], out.len() as u64)
                .await;
            if res? == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(FileBuffering::empty(), 0, None)]
    #[case::sequential(FileBuffering::SEQUENTIAL, 0, Some(libc::POSIX_FADV_SEQUENTIAL))]
    #[case::random(FileBuffering::RANDOM_ACCESS, 0, Some(libc::POSIX_FADV_RANDOM))]
    #[case::direct(FileBuffering::UNBUFFERED, libc::O_DIRECT, None)]
    #[case::dsync_sequential(
        FileBuffering::WRITE_THROUGH | FileBuffering::SEQUENTIAL,
        libc::O_DSYNC,
        Some(libc::POSIX_FADV_SEQUENTIAL)
    )]
    fn test_buffering_flags(
        #[case] buffering: FileBuffering,
        #[case] flags: libc::c_int,
        #[case] advice: Option<libc::c_int>,
    ) {
        assert_eq!(buffering.open_flags(), flags);
        assert_eq!(buffering.advice(), advice);
    }
}
