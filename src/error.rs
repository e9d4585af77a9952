//! Core error taxonomy
//!
//! Every component returns typed errors from this taxonomy; callers decide
//! what to do with them. Step handlers convert expected errors into
//! structured step outcomes and never let them escape the worker loop, so
//! no error class here is permitted to halt the scheduler or lifecycle.

use thiserror::Error;

/// Typed failure classes shared by all core components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Precondition violation (self-loop edge, undersized hyperedge, bad
    /// stream count). Never retried, surfaced to the caller.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Missing referent (node id, goal id, wisdom id). Operation rejected.
    #[error("not found: {0}")]
    NotFound(String),

    /// Violated invariant under contention, e.g. a duplicate id. The caller
    /// may retry with a fresh id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O or capability failure eligible for bounded retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Cooperative cancellation. Never treated as component failure.
    #[error("cancelled")]
    Cancelled,

    /// Generated text failed the identity coherence check; the caller falls
    /// back to the deterministic template.
    #[error("coherence violation: {0}")]
    CoherenceViolation(String),

    /// Irrecoverable startup/restore condition. The only class allowed to
    /// abort the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Short class name for structured status reports.
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::InvalidArg(_) => "invalid_arg",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Cancelled => "cancelled",
            Self::CoherenceViolation(_) => "coherence_violation",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a bounded retry is permitted for this class.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result alias used across the core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_are_stable() {
        assert_eq!(CoreError::InvalidArg("x".into()).class(), "invalid_arg");
        assert_eq!(CoreError::NotFound("x".into()).class(), "not_found");
        assert_eq!(CoreError::Conflict("x".into()).class(), "conflict");
        assert_eq!(CoreError::Transient("x".into()).class(), "transient");
        assert_eq!(CoreError::Cancelled.class(), "cancelled");
        assert_eq!(
            CoreError::CoherenceViolation("x".into()).class(),
            "coherence_violation"
        );
        assert_eq!(CoreError::Fatal("x".into()).class(), "fatal");
    }

    #[test]
    fn only_transient_is_retriable() {
        assert!(CoreError::Transient("io".into()).is_retriable());
        assert!(!CoreError::InvalidArg("x".into()).is_retriable());
        assert!(!CoreError::Cancelled.is_retriable());
        assert!(!CoreError::Fatal("x".into()).is_retriable());
    }

    #[test]
    fn display_carries_the_context() {
        let err = CoreError::NotFound("node 42".into());
        assert_eq!(err.to_string(), "not found: node 42");
        assert_eq!(CoreError::Cancelled.to_string(), "cancelled");
    }
}
