//! Core error types.

use thiserror::Error;
use tracepat_state::StateError;

/// Errors from the pattern engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("attribute not found: {path}")]
    AttributeNotFound { path: String },

    #[error("invalid pattern definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    #[error("unknown transition input: {id}")]
    UnknownTest { id: String },

    #[error("unknown action: {id}")]
    UnknownAction { id: String },

    #[error("unknown fsm: {id}")]
    UnknownFsm { id: String },

    #[error("unknown state '{state}' in fsm '{fsm}'")]
    UnknownState { fsm: String, state: String },

    #[error("cannot compare {left} with {right}")]
    TypeMismatch { left: String, right: String },

    #[error("reference time {reference} is after event time {timestamp}")]
    TimeOrdering { reference: i64, timestamp: i64 },

    #[error("automatic state '{state}' in fsm '{fsm}' chains without making progress")]
    AutomaticCycle { fsm: String, state: String },

    #[error("state store error: {0}")]
    Store(#[from] StateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Returns true for malformed definitions, whether caught at load time or on first use.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::UnknownTest { .. }
                | CoreError::UnknownAction { .. }
                | CoreError::UnknownFsm { .. }
                | CoreError::UnknownState { .. }
                | CoreError::TypeMismatch { .. }
                | CoreError::TimeOrdering { .. }
                | CoreError::AutomaticCycle { .. }
        )
    }

    /// Returns an error code suitable for reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::AttributeNotFound { .. } => "ATTRIBUTE_NOT_FOUND",
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidEvent { .. } => "INVALID_EVENT",
            CoreError::UnknownTest { .. } => "INVALID_DEFINITION",
            CoreError::UnknownAction { .. } => "INVALID_DEFINITION",
            CoreError::UnknownFsm { .. } => "INVALID_DEFINITION",
            CoreError::UnknownState { .. } => "INVALID_DEFINITION",
            CoreError::TypeMismatch { .. } => "TYPE_MISMATCH",
            CoreError::TimeOrdering { .. } => "TIME_ORDERING",
            CoreError::AutomaticCycle { .. } => "AUTOMATIC_CYCLE",
            CoreError::Store(StateError::AttributeNotFound { .. }) => "ATTRIBUTE_NOT_FOUND",
            CoreError::Store(_) => "STORE_WRITE_FAILURE",
            CoreError::Json(_) | CoreError::Yaml(_) => "BAD_DEFINITION_DOCUMENT",
            CoreError::Io(_) => "IO_ERROR",
        }
    }

    /// Returns true if the error only means a lookup did not resolve.
    pub fn is_attribute_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::AttributeNotFound { .. }
                | CoreError::Store(StateError::AttributeNotFound { .. })
        )
    }
}
