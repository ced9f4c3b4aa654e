//! Error taxonomy for layout construction, native calls and trampolines

use crate::interop::LayoutState;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = FfiError> = std::result::Result<T, E>;

/// Errors surfaced by the marshaling core
///
/// None of these are retried here; recovery policy belongs to the caller.
#[derive(Debug, Error)]
pub enum FfiError {
    /// Growable element storage or executable closure memory could not be allocated
    #[error("out of memory while allocating {0}")]
    OutOfMemory(&'static str),

    /// libffi rejected the argument/return type combination
    #[error("bad calling convention: libffi rejected the type layout")]
    BadCallingConvention,

    /// libffi rejected the requested ABI
    #[error("bad ABI: {0} is not supported on this target")]
    BadAbi(u32),

    /// The native function left a nonzero `errno` behind
    #[error("{function}: {}", describe_os_error(.code))]
    OsError { code: i32, function: String },

    /// A builder, descriptor or binding chain was used in a state its contract forbids
    #[error("design invariant violated in {operation}: {detail}")]
    DesignInvariantViolation {
        operation: &'static str,
        detail: String,
    },

    /// Alignments must be nonzero powers of two
    #[error("invalid alignment {0}: must be a nonzero power of two")]
    InvalidAlignment(usize),
}

fn describe_os_error(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

impl FfiError {
    /// Disallowed state-machine transition
    pub(crate) fn wrong_state(operation: &'static str, state: LayoutState) -> Self {
        Self::DesignInvariantViolation {
            operation,
            detail: format!("not permitted in state {:?}", state),
        }
    }

    /// The OS error code, if this is an `OsError`
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::OsError { code, .. } => Some(*code),
            _ => None,
        }
    }
}
