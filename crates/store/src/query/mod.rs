//! Reactive queries over a store's state.
//!
//! A query is `selector → filter → options`:
//!
//! - the [`Selector`] projects the state (identity, JSON pointer or closure);
//! - an optional [`QueryFilter`] either runs a document query over an
//!   array-shaped projection or evaluates a path expression against it;
//! - [`QueryOptions`] sort, skip and limit document query results.
//!
//! [`QueryHandle::snapshot`] evaluates once; [`QueryHandle::stream`] emits
//! the current value immediately and then every value that differs from the
//! last one emitted.

mod document;
mod path;

use std::sync::Arc;

use rfx_events::{Feed, Subscription};
use serde_json::Value;
use tracing::warn;

use crate::error::QueryError;
use crate::store::StoreInner;

pub use document::DocumentQuery;
pub use path::PathExpr;

/// Projection applied to the state before filtering.
#[derive(Clone)]
pub struct Selector(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl Selector {
    pub fn identity() -> Self {
        Self(Arc::new(Value::clone))
    }

    /// The value at a JSON pointer (`/items/0/sku`), `null` when absent.
    pub fn pointer(pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        Self(Arc::new(move |state: &Value| {
            state.pointer(&pointer).cloned().unwrap_or(Value::Null)
        }))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn select(&self, state: &Value) -> Value {
        (self.0)(state)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::identity()
    }
}

impl core::fmt::Debug for Selector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Selector(..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryFilter {
    /// Predicate/sort/skip/limit over an array of documents.
    Documents(DocumentQuery),
    /// Pure extraction from the projection.
    Path(PathExpr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Sort order and paging for document queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryOptions {
    pub sort: Vec<SortKey>,
    pub offset: usize,
    pub page_size: Option<usize>,
}

impl QueryOptions {
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// Everything needed to turn a state into a query result.
#[derive(Debug, Clone)]
struct Projection {
    selector: Selector,
    filter: Option<QueryFilter>,
    options: QueryOptions,
}

impl Projection {
    fn evaluate(&self, state: &Value) -> Result<Value, QueryError> {
        let projected = self.selector.select(state);
        match &self.filter {
            None => Ok(projected),
            Some(QueryFilter::Documents(query)) => query.run(&projected, &self.options),
            Some(QueryFilter::Path(expr)) => Ok(expr.evaluate(&projected)),
        }
    }
}

/// A query bound to a store.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<StoreInner>,
    projection: Projection,
}

impl core::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("store_id", &self.inner.id)
            .field("filter", &self.projection.filter)
            .field("options", &self.projection.options)
            .finish()
    }
}

impl QueryHandle {
    pub(crate) fn new(
        inner: Arc<StoreInner>,
        selector: Selector,
        filter: Option<QueryFilter>,
        options: QueryOptions,
    ) -> Self {
        Self {
            inner,
            projection: Projection {
                selector,
                filter,
                options,
            },
        }
    }

    /// Evaluate against the current state.
    pub fn snapshot(&self) -> Result<Value, QueryError> {
        self.projection.evaluate(&self.inner.snapshot().state)
    }

    /// Current value now, then every change of the result.
    ///
    /// Each call gets its own subscription; dropping it stops the evaluation
    /// task. Evaluation errors are logged and that emission skipped.
    pub fn stream(&self) -> Subscription<Value> {
        // Register before reading the snapshot: a transition landing in
        // between is then seen twice and deduplicated, never missed.
        let mut transitions = self.inner.subscribe_transitions();
        let initial = self.inner.snapshot().state;
        let projection = self.projection.clone();
        let store_id = self.inner.id.clone();
        let (mut feed, subscription) = Subscription::channel();

        tokio::spawn(async move {
            let mut last: Option<Value> = None;
            if !emit(&projection, &initial, &mut last, &feed, &store_id) {
                return;
            }
            loop {
                let transition = tokio::select! {
                    transition = transitions.recv() => match transition {
                        Some(transition) => transition,
                        None => return,
                    },
                    _ = feed.disposed() => return,
                };
                if !emit(&projection, &transition.new, &mut last, &feed, &store_id) {
                    return;
                }
            }
        });

        subscription
    }
}

/// Send the result for `state` unless it equals the last one sent.
///
/// Returns `false` once the subscriber is gone.
fn emit(
    projection: &Projection,
    state: &Value,
    last: &mut Option<Value>,
    feed: &Feed<Value>,
    store_id: &str,
) -> bool {
    match projection.evaluate(state) {
        Ok(value) if last.as_ref() != Some(&value) => {
            *last = Some(value.clone());
            feed.send(value)
        }
        Ok(_) => true,
        Err(e) => {
            warn!(store_id = %store_id, error = %e, "query evaluation failed");
            true
        }
    }
}
