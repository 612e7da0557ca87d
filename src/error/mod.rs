//! This module contains the error types for the various subsystems of the
//! engine, as well as shared containers for locating and aggregating them.

pub mod container;
pub mod execution;
pub mod protocol;
pub mod solver;

use thiserror::Error;

/// The top-level error type, aggregating the errors of all subsystems.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// Errors that occurred while executing a state.
    #[error(transparent)]
    Execution(#[from] execution::LocatedError),

    /// Errors that occurred while talking to the solver.
    #[error(transparent)]
    Solver(#[from] solver::Error),

    /// Errors that occurred in the master-worker protocol.
    #[error(transparent)]
    Protocol(#[from] protocol::Error),

    /// Failures while persisting outputs. These are fatal for the worker.
    #[error("Output failure: {message}")]
    Output { message: String },
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Output {
            message: value.to_string(),
        }
    }
}

/// The result type used by operations that can fail with any engine error.
pub type Result<T> = std::result::Result<T, Error>;
