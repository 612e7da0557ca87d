//! This module contains errors pertaining to the symbolic execution of the
//! program under analysis.

use thiserror::Error;

use crate::error::container;

/// Errors that occur while the engine executes a state.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Call to unknown function {name:?}")]
    UnknownFunction { name: String },

    #[error("Calling function {name:?} with {given} arguments but {expected} expected")]
    ArgumentCountMismatch {
        name:     String,
        given:    usize,
        expected: usize,
    },

    #[error("Register {register} read before being written")]
    UnboundRegister { register: u32 },

    #[error("Phi node executed without a known incoming block")]
    PhiWithoutIncomingBlock,

    #[error("Return from a frame that has no caller")]
    ReturnFromEntry,

    #[error("Width mismatch: expected {expected} bits, found {found} bits")]
    WidthMismatch { expected: u32, found: u32 },

    #[error("No memory object maps the address 0x{address:x}")]
    UnmappedAddress { address: u64 },

    #[error("Access of {size} bytes at offset {offset} overruns object of size {object_size}")]
    OutOfBoundsAccess {
        offset:      u64,
        size:        u64,
        object_size: u64,
    },

    #[error("Load at offset {offset} does not line up with any prior store")]
    MisalignedCell { offset: u64 },

    #[error("Write to read-only object at 0x{address:x}")]
    ReadOnlyObject { address: u64 },

    #[error("Free of an address that is not the start of an allocation: 0x{address:x}")]
    InvalidFree { address: u64 },

    #[error("Unable to resolve address expression to a single concrete address")]
    UnresolvedAddress,

    #[error("Unsupported instruction: {what}")]
    UnsupportedInstruction { what: String },

    #[error("Execution was stopped by the watchdog")]
    StoppedByWatchdog,

    #[error("The process tree is inconsistent: {reason}")]
    CorruptProcessTree { reason: String },

    #[error("State {id} does not exist")]
    NoSuchState { id: u64 },
}

/// An execution error with an associated location in the program.
pub type LocatedError = container::Located<Error>;

/// A container of execution errors used for aggregation during a run.
pub type Errors = container::Errors<LocatedError>;

/// The result type for methods that may have execution errors.
pub type Result<T> = std::result::Result<T, LocatedError>;

/// The reasons a state can be terminated with an error test case.
///
/// Each reason produces a `.err` test case suffixed with its lower-case
/// name, and participates in the exit-on-error policy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum TerminateReason {
    /// The program called `abort`.
    Abort,
    /// An assertion failed.
    Assert,
    /// Illegal or malformed IR was executed.
    Exec,
    /// An external function call failed.
    External,
    /// An invalid `free` was performed.
    Free,
    /// A memory model limit was reached.
    Model,
    /// An arithmetic overflow check failed.
    Overflow,
    /// An invalid pointer was dereferenced.
    Ptr,
    /// A read-only memory object was written.
    ReadOnly,
    /// The program reported an error explicitly.
    ReportError,
    /// The program misused an engine intrinsic.
    User,
    /// The engine could not handle the construct.
    Unhandled,
}

impl TerminateReason {
    /// Gets the suffix used for the test-case file emitted when a state is
    /// terminated for this reason.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Abort => "abort.err",
            Self::Assert => "assert.err",
            Self::Exec => "exec.err",
            Self::External => "external.err",
            Self::Free => "free.err",
            Self::Model => "model.err",
            Self::Overflow => "overflow.err",
            Self::Ptr => "ptr.err",
            Self::ReadOnly => "readonly.err",
            Self::ReportError => "reporterror.err",
            Self::User => "user.err",
            Self::Unhandled => "unhandled.err",
        }
    }
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Make it possible to attach locations to these errors.
impl container::Locatable for Error {
    type Located = LocatedError;

    fn locate(self, instruction_id: u64, source: Option<(String, u32)>) -> Self::Located {
        container::Located {
            instruction_id,
            source,
            payload: self,
        }
    }
}
