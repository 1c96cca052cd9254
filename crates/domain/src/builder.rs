//! Assembling a domain before it takes traffic.
//!
//! Everything a domain knows is registered here, then [`DomainBuilder::build`]
//! freezes it into an immutable [`DomainSpec`]. A built [`Domain`] has no
//! registration API, so the set of mutations, effects and views cannot change
//! under live instances.

use std::collections::HashMap;
use std::sync::Arc;

use rfx_core::DomainId;
use rfx_store::{Bus, MutationContext, MutationTable};
use serde_json::Value;

use crate::domain::{Domain, DomainOptions, DomainSpec, SchemaKind, SchemaSpec};
use crate::effects::Effect;
use crate::index::InstanceIndex;
use crate::view::ViewSpec;

/// Consuming builder for a [`Domain`].
///
/// ```ignore
/// let orders = DomainBuilder::new("orders")
///     .add_mutation("change-status", |state, payload, _| {
///         state["status"] = payload["status"].clone();
///         Ok(())
///     })
///     .add_effect(Effect::new("order:activated").when(|new, _, _| new["status"] == "active"))
///     .build(bus, Arc::new(InMemoryInstanceIndex::new()));
/// ```
#[must_use]
pub struct DomainBuilder {
    name: String,
    options: DomainOptions,
    mutations: MutationTable,
    views: HashMap<String, ViewSpec>,
    effects: Vec<Effect>,
    schemas: HashMap<String, SchemaSpec>,
    mountpoints: HashMap<String, Value>,
}

impl DomainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: DomainOptions::default(),
            mutations: MutationTable::new(),
            views: HashMap::new(),
            effects: Vec::new(),
            schemas: HashMap::new(),
            mountpoints: HashMap::new(),
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.options.system = system.into();
        self
    }

    pub fn revision(mut self, revision: u32) -> Self {
        self.options.revision = revision;
        self
    }

    /// Replace all runtime options, `system` and `revision` included.
    pub fn options(mut self, options: DomainOptions) -> Self {
        self.options = options;
        self
    }

    /// Register (or replace) the mutator for `key`.
    pub fn add_mutation<F>(mut self, key: impl Into<String>, mutator: F) -> Self
    where
        F: Fn(&mut Value, &Value, &MutationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.mutations.insert(key, mutator);
        self
    }

    /// Effects are evaluated in registration order.
    pub fn add_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn add_view(mut self, key: impl Into<String>, view: ViewSpec) -> Self {
        self.views.insert(key.into(), view);
        self
    }

    /// Store a JSON schema for requests, mutations or queries.
    ///
    /// `selector` is a JSON pointer to the part of the state the schema
    /// covers; `None` means the whole state. Schemas are recorded, not
    /// enforced.
    pub fn add_schema(
        mut self,
        key: impl Into<String>,
        kind: SchemaKind,
        selector: Option<&str>,
        spec: Value,
    ) -> Self {
        self.schemas.insert(
            key.into(),
            SchemaSpec {
                kind,
                selector: selector.map(str::to_string),
                spec,
            },
        );
        self
    }

    pub fn add_mountpoint(mut self, key: impl Into<String>, spec: Value) -> Self {
        self.mountpoints.insert(key.into(), spec);
        self
    }

    /// Freeze the registrations without attaching a bus.
    pub fn freeze(self) -> (DomainSpec, DomainOptions) {
        let id = DomainId::derive(&self.options.system, &self.name, self.options.revision);
        let spec = DomainSpec {
            full_name: format!("{}:{}", self.options.system, self.name),
            system: self.options.system.clone(),
            name: self.name,
            revision: self.options.revision,
            id,
            mutations: Arc::new(self.mutations),
            views: self.views,
            effects: self.effects.into(),
            schemas: self.schemas,
            mountpoints: self.mountpoints,
        };
        (spec, self.options)
    }

    pub fn build(self, bus: Bus, index: Arc<dyn InstanceIndex>) -> Domain {
        let (spec, options) = self.freeze();
        Domain::new(Arc::new(spec), options, bus, index)
    }
}
