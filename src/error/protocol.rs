//! This module contains errors arising in the master-worker coordination
//! protocol.

use thiserror::Error;

/// Errors that occur while coordinating workers.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The fabric to rank {rank} is disconnected")]
    Disconnected { rank: usize },

    #[error("Received a message that is invalid in the current protocol phase: {what}")]
    UnexpectedMessage { what: String },

    #[error("Composite prefix is malformed: {reason}")]
    MalformedPrefix { reason: String },

    #[error("No suspended state matches the dispatched prefix {prefix:?}")]
    NoSuspendedMatch { prefix: String },

    #[error("Worker {rank} failed to produce work for an offload request")]
    OffloadFailed { rank: usize },
}

/// The result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
