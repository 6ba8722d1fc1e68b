//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Storage and transport failures are
/// wrapped by the infrastructure error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced invoice, item, payment or catalog entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invoice status change that the lifecycle does not allow.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Reserved functionality. Callers must not depend on it.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A conflict occurred (e.g. duplicate identifier with different content).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn transition(from: impl core::fmt::Debug, to: impl core::fmt::Debug) -> Self {
        Self::InvalidStateTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedOperation(operation)
    }
}
