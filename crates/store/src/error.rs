//! Store error model.

use rfx_core::CoreError;
use rfx_events::TransportError;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No mutator is registered under this key.
    #[error("unknown mutation: {0}")]
    UnknownMutation(String),

    /// A request entry carried a type other than `mutate`.
    #[error("unsupported request type: {0}")]
    UnsupportedRequest(String),

    /// A request entry could not be decoded.
    #[error("malformed request {entry_id}: {reason}")]
    MalformedRequest { entry_id: String, reason: String },

    /// The mutator itself failed; no frame was written.
    #[error("mutation {key} failed: {source}")]
    Mutation {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// `init` was called on a store that already has frames.
    #[error("store {0} is already initialized")]
    AlreadyInitialized(String),

    /// The store was disposed while waiting on it.
    #[error("store {0} is closed")]
    Closed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl StoreError {
    pub fn unknown_mutation(key: impl Into<String>) -> Self {
        Self::UnknownMutation(key.into())
    }

    pub fn malformed(entry_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            entry_id: entry_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Core(CoreError::from(value))
    }
}

/// Failure evaluating a query against the current state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Document queries run over arrays only.
    #[error("document query expects an array, got {0}")]
    NotAnArray(&'static str),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid path expression {expr:?}: {reason}")]
    InvalidPath { expr: String, reason: String },
}

impl QueryError {
    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    pub fn invalid_path(expr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}
