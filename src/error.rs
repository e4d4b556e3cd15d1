//! Recoverable trace errors
//!
//! These are domain failures raised while simulating user programs. Internal
//! invariant violations (graph corruption, request-count underflow, regen
//! count mismatch) are not represented here: they panic.

use crate::arena::NodeId;
use crate::value::Value;
use thiserror::Error;

/// Trace result type
pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{procedure}: invalid argument: {message}")]
    InvalidArgument {
        procedure: &'static str,
        message: String,
    },

    #[error("{procedure}: expected {expected} arguments, got {got}")]
    Arity {
        procedure: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("cannot apply non-procedure value {0}")]
    NotAProcedure(Value),

    #[error("lookup of reclaimed node {0:?}")]
    DanglingLookup(NodeId),

    #[error("recursive request loop detected for family {0}")]
    RecursiveFamily(Value),

    #[error("cannot constrain a deterministic value")]
    ConstrainDeterministic,

    #[error("random choice is already constrained")]
    AlreadyConstrained,

    #[error("{0}")]
    ConstraintPropagation(&'static str),

    #[error("directive {0} is still referenced by other nodes")]
    DirectiveInUse(u64),

    #[error("unknown directive {0}")]
    UnknownDirective(u64),

    #[error("directive {0} is already registered")]
    DuplicateDirective(u64),

    #[error("scope {0} has no blocks")]
    EmptyScope(Value),
}

impl TraceError {
    pub fn invalid(procedure: &'static str, message: impl Into<String>) -> Self {
        TraceError::InvalidArgument {
            procedure,
            message: message.into(),
        }
    }
}
