//! Named views: a stored selector/filter/options triple resolved into a
//! query against an instance's store.

use rfx_store::{QueryFilter, QueryHandle, QueryOptions, Selector, Store};

/// Key of the view used as an instance's index summary, when registered.
pub const INDEX_VIEW: &str = "index";

#[derive(Debug, Clone, Default)]
pub struct ViewSpec {
    pub selector: Selector,
    pub filter: Option<QueryFilter>,
    pub options: QueryOptions,
}

impl ViewSpec {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub(crate) fn resolve(&self, store: &Store) -> QueryHandle {
        store.query(
            self.selector.clone(),
            self.filter.clone(),
            self.options.clone(),
        )
    }
}
