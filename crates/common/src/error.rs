use thiserror::Error;

/// Canonical quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::InvalidArgument`]: caller-supplied values that violate an
///   operation contract
/// - [`QuarryError::InvalidState`]: operations issued against an object in
///   the wrong lifecycle state
/// - [`QuarryError::ExecutionFailure`]: runtime failures reported by or on
///   behalf of task execution; recoverable at the task boundary
/// - [`QuarryError::Fatal`]: unrecoverable runtime errors; propagated after
///   the task is marked failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuarryError {
    /// Caller-supplied argument violates the operation contract.
    ///
    /// Examples:
    /// - zero-byte result fetch size
    /// - unknown output buffer id
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not valid for the current lifecycle state.
    ///
    /// Examples:
    /// - first task update without a plan fragment
    /// - results fetch before the output buffer is initialized
    /// - duplicate catalog registration
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Runtime execution failure.
    ///
    /// Examples:
    /// - split intake rejected by the operator runtime
    /// - query memory budget exhausted
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// Unrecoverable runtime error.
    ///
    /// The task is marked failed and the error is propagated to the caller
    /// instead of being absorbed into the task snapshot.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl QuarryError {
    /// Returns whether this error must be propagated after failing the task.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Short stable kind label used in failure records and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidState(_) => "invalid_state",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Standard quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
