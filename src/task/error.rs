use crate::task::Id;
use std::any::Any;
use std::fmt;
use std::io;

/// Why a task did not produce its value.
pub struct TaskError {
    repr: Repr,
    id: Option<Id>,
}

enum Repr {
    Cancelled,
    Panic {
        payload: SyncWrapper<Box<dyn Any + Send + 'static>>,
        // Read through `&self`, so captured up front.
        message: Option<String>,
    },
}

/// Makes a `Send` value `Sync` by only ever handing it out by value.
struct SyncWrapper<T>(T);

// Safety: the wrapped value is never reachable through a shared reference.
unsafe impl<T: Send> Sync for SyncWrapper<T> {}

impl TaskError {
    pub(crate) fn cancelled(id: Option<Id>) -> TaskError {
        TaskError {
            repr: Repr::Cancelled,
            id,
        }
    }

    pub(crate) fn panic(id: Option<Id>, payload: Box<dyn Any + Send + 'static>) -> TaskError {
        let message = panic_payload_as_str(payload.as_ref()).map(str::to_owned);
        TaskError {
            repr: Repr::Panic {
                payload: SyncWrapper(payload),
                message,
            },
            id,
        }
    }

    /// Returns true if the task was dropped before it completed, for example
    /// because the runtime shut down.
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.repr, Repr::Cancelled)
    }

    /// Returns true if the task body panicked.
    pub fn is_panic(&self) -> bool {
        matches!(&self.repr, Repr::Panic { .. })
    }

    /// Consumes the error, returning the object with which the task panicked.
    ///
    /// # Panics
    ///
    /// Panics if the error does not represent a panic. Use
    /// [`try_into_panic`](TaskError::try_into_panic) for a fallible variant.
    ///
    /// The payload can be re-raised with [`std::panic::resume_unwind`].
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.try_into_panic()
            .expect("`TaskError` reason is not a panic.")
    }

    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, TaskError> {
        match self.repr {
            Repr::Panic { payload, .. } => Ok(payload.0),
            _ => Err(self),
        }
    }

    /// The panic message, when the payload is a string.
    pub fn panic_message(&self) -> Option<&str> {
        match &self.repr {
            Repr::Panic { message, .. } => message.as_deref(),
            Repr::Cancelled => None,
        }
    }

    /// The ID of the task that failed, if it was spawned.
    pub fn id(&self) -> Option<Id> {
        self.id
    }
}

pub(crate) fn panic_payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<String>() {
        return Some(s);
    }

    payload.downcast_ref::<&'static str>().copied()
}

impl fmt::Display for TaskError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.map(|id| id.to_string());
        let id = id.as_deref().unwrap_or("<inline>");

        match &self.repr {
            Repr::Cancelled => write!(fmt, "task {id} was cancelled"),
            Repr::Panic { message, .. } => match message {
                Some(msg) => write!(fmt, "task {id} panicked with message {msg:?}"),
                None => write!(fmt, "task {id} panicked"),
            },
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Cancelled => write!(fmt, "TaskError::Cancelled({:?})", self.id),
            Repr::Panic { message, .. } => match message {
                Some(msg) => write!(fmt, "TaskError::Panic({:?}, {:?}, ...)", self.id, msg),
                None => write!(fmt, "TaskError::Panic({:?}, ...)", self.id),
            },
        }
    }
}

impl std::error::Error for TaskError {}

impl From<TaskError> for io::Error {
    fn from(src: TaskError) -> io::Error {
        io::Error::other(match src.repr {
            Repr::Cancelled => "task was cancelled",
            Repr::Panic { .. } => "task panicked",
        })
    }
}
