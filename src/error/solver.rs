//! This module contains errors produced while querying the constraint
//! solver.

use thiserror::Error;

/// Errors that occur during solver queries.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Solver query exceeded its {timeout_ms}ms timeout")]
    Timeout { timeout_ms: u64 },

    #[error("The decision procedure could not decide the query: {reason}")]
    Unknown { reason: String },

    #[error("The constraint set is unsatisfiable but a model was requested")]
    NoModel,

    #[error("Expression is not a boolean: width is {width} bits")]
    NotABoolean { width: u32 },
}

/// The result type for solver queries.
pub type Result<T> = std::result::Result<T, Error>;
