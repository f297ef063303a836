//! Asynchronous file I/O and the io scheduler, backed by a shared io_uring.

mod errors;
pub use errors::IoError;

mod file;
pub use file::{AsyncFile, FileAccess, FileBuffering, FileOpenMode};

mod op;
pub use op::{BufResult, CURRENT_POSITION, FileOp, ReadAt, WriteAt};

mod ring;

mod scheduler;
pub use scheduler::{IoHandle, IoScheduler};

mod slab;

mod stream;
pub use stream::{AsyncStream, MemoryStream, STREAM_BUFFER_SIZE, StreamMode};
