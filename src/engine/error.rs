use std::fmt;
use thiserror::Error;

/// OS error code returned when the lockout observation window would exceed
/// the lockout duration (ERROR_INVALID_PARAMETER from NetUserModalsSet).
pub const LOCKOUT_SEQUENCING_CODE: u32 = 87;

/// Failure reported by a policy accessor or command channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessorError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("OS call failed with code {code}: {message}")]
    Os { code: u32, message: String },

    #[error("helper exited with code {code}: {message}")]
    HelperExit { code: i32, message: String },

    #[error("command channel failure: {0}")]
    Channel(String),
}

/// Single error enum for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("accessor failure: {0}")]
    Accessor(#[from] AccessorError),

    #[error("verification indeterminate: {0}")]
    Indeterminate(String),

    #[error("sequencing failure (code {code}): {detail}")]
    Sequencing { code: u32, detail: String },

    #[error("policy definition error: {0}")]
    Definition(String),

    #[error("duplicate unit id {0} in catalog")]
    DuplicateUnit(uuid::Uuid),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("a bulk operation is already running")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("strategy panicked: {0}")]
    Panicked(String),
}

/// Coarse classification used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AccessorFailure,
    VerificationIndeterminate,
    SequencingFailure,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::AccessorFailure => write!(f, "AccessorFailure"),
            FailureKind::VerificationIndeterminate => write!(f, "VerificationIndeterminate"),
            FailureKind::SequencingFailure => write!(f, "SequencingFailure"),
            FailureKind::Other => write!(f, "Other"),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Accessor(AccessorError::Os { code, .. })
                if *code == LOCKOUT_SEQUENCING_CODE =>
            {
                FailureKind::SequencingFailure
            }
            EngineError::Accessor(_) => FailureKind::AccessorFailure,
            EngineError::Indeterminate(_) => FailureKind::VerificationIndeterminate,
            EngineError::Sequencing { .. } => FailureKind::SequencingFailure,
            _ => FailureKind::Other,
        }
    }

    pub fn indeterminate(detail: impl Into<String>) -> Self {
        EngineError::Indeterminate(detail.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
