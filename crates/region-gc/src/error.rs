//! Errors reported to collector clients.
//!
//! Heap corruption (a root outside the reserved heap, a forwarding loop, an
//! unparsable object) is not an error value: it panics at the point of
//! detection.

use std::fmt;
use std::io;

/// Errors from engine creation and allocation.
#[derive(Debug)]
pub enum GcError {
    /// The configuration is inconsistent.
    InvalidConfig(String),
    /// Reserving the heap address range failed.
    ReserveFailed(io::Error),
    /// Committing or uncommitting heap pages failed.
    CommitFailed(io::Error),
    /// No space was found even after a full compaction.
    OutOfMemory {
        /// Size of the failed request.
        requested_bytes: usize,
    },
    /// The object can never fit in the reserved heap.
    ObjectTooLarge {
        /// Size of the failed request.
        requested_bytes: usize,
    },
    /// The concurrent mark thread could not be started.
    ThreadSpawn(io::Error),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid GC configuration: {msg}"),
            Self::ReserveFailed(err) => write!(f, "failed to reserve heap: {err}"),
            Self::CommitFailed(err) => write!(f, "failed to commit heap memory: {err}"),
            Self::OutOfMemory { requested_bytes } => {
                write!(f, "out of memory allocating {requested_bytes} bytes")
            }
            Self::ObjectTooLarge { requested_bytes } => {
                write!(f, "object of {requested_bytes} bytes exceeds the heap")
            }
            Self::ThreadSpawn(err) => write!(f, "failed to start the mark thread: {err}"),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReserveFailed(err) | Self::CommitFailed(err) | Self::ThreadSpawn(err) => {
                Some(err)
            }
            _ => None,
        }
    }
}
