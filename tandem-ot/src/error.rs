//! Error types for the operation algebra.

use thiserror::Error;

/// Errors produced while validating, transforming or applying operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OtError {
    /// The operation is malformed or cannot be applied to the current value:
    /// out-of-range position/index, empty insert text, non-positive delete
    /// length, move with equal source and target, empty map key.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation targets a different value kind than the document holds
    /// (e.g. a text op applied to a list document).
    #[error("operation kind {op} does not match document kind {doc}")]
    KindMismatch { op: &'static str, doc: &'static str },

    /// A wire record could not be decoded into a typed operation.
    #[error("malformed operation record: {0}")]
    Malformed(String),

    /// Snapshot payload does not match the document schema.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl OtError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        OtError::InvalidOperation(msg.into())
    }
}
