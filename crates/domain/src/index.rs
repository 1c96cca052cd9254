//! The instance index: one summary document per live instance of a domain.
//!
//! `Domain::create` pushes, `Domain::remove` removes and `Domain::find`
//! selects. Backends are external; [`InMemoryInstanceIndex`] serves tests and
//! single-process deployments.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use rfx_core::InstanceId;
use rfx_store::DocumentQuery;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by an index backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index backend unavailable: {0}")]
    Unavailable(String),

    #[error("index rejected the selector: {0}")]
    InvalidSelector(String),
}

/// Which instances a `find`/`remove` applies to.
#[derive(Debug, Clone)]
pub enum IndexSelector {
    All,
    Id(InstanceId),
    Ids(Vec<InstanceId>),
    /// Instances whose summary matches the document query.
    Matching(DocumentQuery),
}

impl IndexSelector {
    pub fn matches(&self, id: &InstanceId, summary: &Value) -> Result<bool, IndexError> {
        match self {
            Self::All => Ok(true),
            Self::Id(wanted) => Ok(wanted == id),
            Self::Ids(wanted) => Ok(wanted.contains(id)),
            Self::Matching(query) => query
                .matches(summary)
                .map_err(|e| IndexError::InvalidSelector(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: InstanceId,
    pub summary: Value,
}

#[async_trait]
pub trait InstanceIndex: Send + Sync {
    /// Insert or replace the summary of `id`.
    async fn push(&self, id: &InstanceId, summary: Value) -> Result<(), IndexError>;

    /// Remove `id`, returning its summary if it was present.
    async fn remove(&self, id: &InstanceId) -> Result<Option<Value>, IndexError>;

    async fn select(&self, selector: &IndexSelector) -> Result<Vec<IndexEntry>, IndexError>;
}

#[async_trait]
impl<I> InstanceIndex for Arc<I>
where
    I: InstanceIndex + ?Sized,
{
    async fn push(&self, id: &InstanceId, summary: Value) -> Result<(), IndexError> {
        (**self).push(id, summary).await
    }

    async fn remove(&self, id: &InstanceId) -> Result<Option<Value>, IndexError> {
        (**self).remove(id).await
    }

    async fn select(&self, selector: &IndexSelector) -> Result<Vec<IndexEntry>, IndexError> {
        (**self).select(selector).await
    }
}

/// In-memory index for tests/dev. Entries are kept ordered by instance id.
#[derive(Debug, Default)]
pub struct InMemoryInstanceIndex {
    entries: RwLock<BTreeMap<InstanceId, Value>>,
}

impl InMemoryInstanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InstanceIndex for InMemoryInstanceIndex {
    async fn push(&self, id: &InstanceId, summary: Value) -> Result<(), IndexError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), summary);
        Ok(())
    }

    async fn remove(&self, id: &InstanceId) -> Result<Option<Value>, IndexError> {
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id))
    }

    async fn select(&self, selector: &IndexSelector) -> Result<Vec<IndexEntry>, IndexError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut selected = Vec::new();
        for (id, summary) in entries.iter() {
            if selector.matches(id, summary)? {
                selected.push(IndexEntry {
                    id: id.clone(),
                    summary: summary.clone(),
                });
            }
        }
        Ok(selected)
    }
}
