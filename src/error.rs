//! Error types for shmq.

use std::io;

use crate::request::QueueId;

/// Errors produced by the IPC substrate.
///
/// `Full`, `Empty` and `OutOfMemory` are expected backpressure signals and
/// are handled by caller retry; `InvalidState` indicates shared-memory
/// corruption and is fatal to the affected process.
#[derive(Debug)]
pub enum Error {
    /// Ring buffer is at max depth; retry after the consumer drains.
    Full,
    /// Ring buffer has no published entries.
    Empty,
    /// Every allocator shard is out of free slots.
    OutOfMemory,
    /// Integrity check failed: stamp/refcount mismatch, double free, or a
    /// free that could not be completed. The region is corrupt.
    InvalidState(&'static str),
    /// An offset resolved outside the region it was checked against.
    AddressOutOfRange { off: i64, len: usize },
    /// Requested region/queue sizing is infeasible.
    Config(String),
    /// A queue pair could not be attached or registered.
    Registration(String),
    /// No module is registered under the namespace id.
    ModuleNotFound(u32),
    /// No queue pair is registered under the id.
    QueuePairNotFound(QueueId),
    /// A bounded wait exceeded its caller-supplied deadline.
    Timeout,
    /// The control-channel peer went away.
    Disconnected,
    /// IO error from the region authority or control channel.
    Io(io::Error),
}

impl Error {
    /// True for backpressure results the caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Full | Error::Empty | Error::OutOfMemory)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Full => write!(f, "ring buffer is full"),
            Error::Empty => write!(f, "ring buffer is empty"),
            Error::OutOfMemory => write!(f, "allocator has no free slots"),
            Error::InvalidState(what) => write!(f, "shared memory corruption: {}", what),
            Error::AddressOutOfRange { off, len } => {
                write!(f, "offset {} outside region of {} bytes", off, len)
            }
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Registration(msg) => write!(f, "registration failed: {}", msg),
            Error::ModuleNotFound(ns_id) => {
                write!(f, "no module registered for namespace id {}", ns_id)
            }
            Error::QueuePairNotFound(qid) => write!(f, "no queue pair registered for {:?}", qid),
            Error::Timeout => write!(f, "wait deadline elapsed"),
            Error::Disconnected => write!(f, "control channel peer disconnected"),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for shmq operations.
pub type Result<T> = std::result::Result<T, Error>;
