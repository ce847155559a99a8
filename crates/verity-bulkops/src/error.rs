//! Error types for bulk operation processing.

use crate::intent::Op;
use thiserror::Error;

/// Result type alias for bulk operation manager calls.
pub type Result<T> = std::result::Result<T, BulkError>;

/// Errors surfaced by the bulk operation manager.
///
/// Errors are `Clone` so that a single batch outcome can be fanned out to
/// every handle that merged into the same queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkError {
    /// The submitted intent cannot be merged with the one already queued.
    #[error("Invalid merge for {kind}:{name}: {new} cannot follow queued {existing}")]
    InvalidMerge {
        kind: String,
        name: String,
        existing: Op,
        new: Op,
    },

    /// The controller rejected this item; siblings are unaffected.
    #[error("Controller rejected {kind}:{name}: {message}")]
    ValidationRejected {
        kind: String,
        name: String,
        message: String,
    },

    /// The controller rejected the whole request without per-item detail.
    #[error("Bulk request for {kind} failed{}: {message}", fmt_status(.status))]
    BatchFailed {
        kind: String,
        status: Option<u16>,
        message: String,
    },

    /// Network error, 5xx or auth expiry that persisted through retries.
    #[error("Transient transport failure for {kind}: {message}")]
    TransportTransient { kind: String, message: String },

    /// The caller's deadline fired first.
    #[error("Deadline exceeded while waiting for {operation}")]
    DeadlineExceeded { operation: String },

    /// The manager was closed before the intent was applied.
    #[error("Intent cancelled by shutdown")]
    Cancelled,

    /// Read path only: the object is not present on the controller.
    #[error("{kind}:{name} not found")]
    NotFound { kind: String, name: String },

    /// The kind is not part of the active dependency catalog.
    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    /// The kind does not accept this operation (e.g. delete of a patch-only kind).
    #[error("Operation {op} is not supported for {kind}")]
    UnsupportedOperation { kind: String, op: Op },

    /// The intent is malformed (missing payload, empty name, ...).
    #[error("Invalid intent for {kind}:{name}: {message}")]
    InvalidIntent {
        kind: String,
        name: String,
        message: String,
    },

    /// Submission after `close()`.
    #[error("Bulk operation manager is closed")]
    Closed,

    /// Configuration or catalog error.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl BulkError {
    /// Creates a validation rejection for a single item.
    pub fn validation_rejected(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ValidationRejected {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a whole-batch failure.
    pub fn batch_failed(kind: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::BatchFailed {
            kind: kind.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates a transient transport failure.
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportTransient {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a deadline error for the named operation.
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates an invalid intent error.
    pub fn invalid_intent(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidIntent {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if the error was produced by the controller for one item.
    pub fn is_item_level(&self) -> bool {
        matches!(self, BulkError::ValidationRejected { .. })
    }

    /// Returns true if the error was raised at submission time.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            BulkError::InvalidMerge { .. }
                | BulkError::UnknownKind(_)
                | BulkError::UnsupportedOperation { .. }
                | BulkError::InvalidIntent { .. }
                | BulkError::Closed
        )
    }
}
