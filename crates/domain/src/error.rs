use rfx_events::TransportError;
use rfx_store::{QueryError, StoreError};
use thiserror::Error;

use crate::index::IndexError;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error)]
pub enum DomainError {
    /// The domain has no mutation registered under this key.
    #[error("unknown mutation: {0}")]
    UnknownMutation(String),

    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<QueryError> for DomainError {
    fn from(value: QueryError) -> Self {
        Self::Store(StoreError::Query(value))
    }
}
