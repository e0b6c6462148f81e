//! Error taxonomy for the crate's subsystems.
//!
//! Each seam gets its own enum rather than a single crate-wide error type,
//! mirroring the way the original shared-memory module kept
//! `SharedMemoryOpenError` separate from plain I/O failures.

use std::fmt;

use crate::task::Status;

/// Errors from creating, attaching, or tearing down a [`crate::shmem::SharedMemory`]
/// segment. Corresponds to the `SHM_ERROR` category.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory segment {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("shared memory segment {name:?} not found")]
    NotFound { name: String },

    #[error(
        "cannot create segment {name:?} with size {requested} bytes: \
         an existing segment of {existing} bytes is smaller than requested"
    )]
    SizeConflict {
        name: String,
        requested: u64,
        existing: u64,
    },

    #[error("shared memory OS error: {0}")]
    Os(#[source] std::io::Error),
}

/// Errors decoding an inbound wire line. These are never surfaced to a
/// caller (`DECODE_ERROR`, §7); a [`crate::service::Service`] routes them
/// to its debug sink and keeps dispatching.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("message is missing required field {0:?}")]
    MissingField(&'static str),

    #[error("unknown responseType {0:?}")]
    UnknownResponseType(String),

    #[error("response references unknown task {0:?}")]
    UnknownTask(String),

    #[error("shared memory error while decoding message: {0}")]
    Shm(#[from] ShmError),
}

/// Raised by [`crate::task::Task::wait_for`] when a task does not end in
/// `COMPLETE`. Carries enough to let the caller report the worker's own
/// diagnostic (`TASK_FAILURE`) or a stable crash reason (`TASK_CRASH`).
#[derive(Debug, Clone)]
pub struct TaskError {
    pub uuid: String,
    pub status: Status,
    pub error: Option<String>,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} ended in {:?}", self.uuid, self.status)?;
        if let Some(err) = &self.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

/// Errors raised synchronously to a caller misusing a [`crate::service::Service`]
/// or [`crate::task::Task`] (`ILLEGAL_STATE`), or from I/O talking to the
/// worker process (`IO_ERROR`).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("task has already been started")]
    AlreadyStarted,

    #[error("task has not been started yet")]
    NotStarted,

    #[error("service is closed")]
    Closed,

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error communicating with worker: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to encode outgoing message: {0}")]
    Encode(#[from] CodecError),
}
