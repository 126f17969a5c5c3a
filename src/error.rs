use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template '{code}' not found for language '{language}'")]
    NotFound { code: String, language: String },

    #[error("Missing variable in template: {0}")]
    VariableMissing(String),

    #[error("Unsupported variable type for key '{0}'")]
    UnsupportedVariable(String),

    #[error("Template store unavailable: {0}")]
    StoreUnavailable(String),
}

impl TemplateError {
    /// Producer-side defects that can never succeed on redelivery.
    pub fn is_data_error(&self) -> bool {
        !matches!(self, TemplateError::StoreUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Malformed queue message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit breaker is open for {provider_id}")]
pub struct CircuitOpenError {
    pub provider_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataError,
    Transient,
    Permanent,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Transient failure from {provider_id}: {reason}")]
    TransientProvider { provider_id: String, reason: String },

    #[error("Permanent failure from {provider_id}: {reason}")]
    PermanentProvider { provider_id: String, reason: String },

    #[error("Dispatch deadline of {}ms exceeded", .deadline.as_millis())]
    DeadlineExceeded { deadline: Duration },
}

impl DispatchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::Template(e) if e.is_data_error() => FailureKind::DataError,
            DispatchError::Template(_) => FailureKind::Transient,
            DispatchError::TransientProvider { .. } => FailureKind::Transient,
            DispatchError::PermanentProvider { .. } => FailureKind::Permanent,
            DispatchError::DeadlineExceeded { .. } => FailureKind::DeadlineExceeded,
        }
    }

    pub fn provider_id(&self) -> Option<&str> {
        match self {
            DispatchError::TransientProvider { provider_id, .. }
            | DispatchError::PermanentProvider { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }
}
