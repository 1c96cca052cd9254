//! Core error model.

use thiserror::Error;

/// Result type used across the core layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Deterministic failures only: a patch that does not fit the document it is
/// applied to, a malformed identifier, or a value that cannot be (de)serialized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A patch could not be applied to the target document.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// A path did not resolve inside the target document.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An identifier was invalid (e.g. empty or malformed).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A value failed to encode or decode.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn invalid_patch(msg: impl Into<String>) -> Self {
        Self::InvalidPatch(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
