//! State store error types.

use thiserror::Error;

/// Errors from the attribute store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("attribute not found: {path}")]
    AttributeNotFound { path: String },

    #[error("invalid quark: {0}")]
    InvalidQuark(usize),

    #[error("out-of-order write on '{path}': last write at {last}, attempted at {attempted}")]
    TimeOrdering {
        path: String,
        last: i64,
        attempted: i64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl StateError {
    /// Returns true if the error comes from a rejected write rather than a lookup.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, StateError::TimeOrdering { .. } | StateError::InvalidQuark(_))
    }
}
