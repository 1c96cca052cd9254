//! Runtime side of a domain: creating, loading, finding and removing
//! instances.

use std::collections::HashMap;
use std::sync::Arc;

use rfx_core::{DomainId, FullInstanceId, Height, InstanceId};
use rfx_store::{
    Bus, Channel, DEFAULT_LOCALE, DEFAULT_SNAPSHOT_THRESHOLD, MutationTable, StoreError,
    StoreOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::effects::Effect;
use crate::error::DomainResult;
use crate::index::{IndexEntry, IndexSelector, InstanceIndex};
use crate::instance::Instance;
use crate::view::ViewSpec;

pub const DEFAULT_SYSTEM: &str = "rfx1";

/// Published on `<domain_id>:events` when an instance is created.
pub const INSTANCE_TRACKED: &str = "instance:tracked";

/// Published on `<domain_id>:events` when an instance leaves the index.
pub const INSTANCE_REMOVED: &str = "instance:removed";

/// When a schema applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Request,
    Mutation,
    Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSpec {
    pub kind: SchemaKind,
    /// JSON pointer into the state; `None` for the whole state.
    pub selector: Option<String>,
    pub spec: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainOptions {
    pub system: String,
    pub revision: u32,
    /// Serve mutations for the instances this process creates or loads.
    ///
    /// At most one process may do so per instance. Replicas that only read
    /// must set this to `false`.
    pub writer: bool,
    pub snapshot_threshold: usize,
    pub locale: String,
}

impl Default for DomainOptions {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            revision: 1,
            writer: true,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

/// Per-call overrides for [`Domain::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip frames at or below this height during replay.
    pub height: Height,
    pub locale: Option<String>,
    /// Overrides [`DomainOptions::writer`].
    pub writer: Option<bool>,
}

impl LoadOptions {
    pub fn from_height(mut self, height: Height) -> Self {
        self.height = height;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn writer(mut self, writer: bool) -> Self {
        self.writer = Some(writer);
        self
    }
}

/// Everything registered on a domain, frozen at build time.
pub struct DomainSpec {
    pub(crate) system: String,
    pub(crate) name: String,
    pub(crate) revision: u32,
    pub(crate) id: DomainId,
    pub(crate) full_name: String,
    pub(crate) mutations: Arc<MutationTable>,
    pub(crate) views: HashMap<String, ViewSpec>,
    pub(crate) effects: Arc<[Effect]>,
    pub(crate) schemas: HashMap<String, SchemaSpec>,
    pub(crate) mountpoints: HashMap<String, Value>,
}

impl core::fmt::Debug for DomainSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainSpec")
            .field("full_name", &self.full_name)
            .field("revision", &self.revision)
            .field("id", &self.id)
            .field("mutations", &self.mutations)
            .field("effects", &self.effects.len())
            .finish_non_exhaustive()
    }
}

impl DomainSpec {
    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn id(&self) -> &DomainId {
        &self.id
    }

    /// `system:name`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn mutations(&self) -> &Arc<MutationTable> {
        &self.mutations
    }

    pub fn view(&self, key: &str) -> Option<&ViewSpec> {
        self.views.get(key)
    }

    pub fn effects(&self) -> &Arc<[Effect]> {
        &self.effects
    }

    pub fn schema(&self, key: &str) -> Option<&SchemaSpec> {
        self.schemas.get(key)
    }

    pub fn mountpoint(&self, key: &str) -> Option<&Value> {
        self.mountpoints.get(key)
    }
}

impl core::fmt::Display for DomainSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{} ({})", self.full_name, self.revision, self.id)
    }
}

/// A built domain. Cheap to clone.
#[derive(Clone)]
pub struct Domain {
    spec: Arc<DomainSpec>,
    options: DomainOptions,
    bus: Bus,
    index: Arc<dyn InstanceIndex>,
    events: Channel,
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("spec", &self.spec)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Domain {
    pub(crate) fn new(
        spec: Arc<DomainSpec>,
        options: DomainOptions,
        bus: Bus,
        index: Arc<dyn InstanceIndex>,
    ) -> Self {
        let events = bus.channel(format!("{}:events", spec.id()));
        info!(domain = %spec, writer = options.writer, "domain ready");
        Self {
            spec,
            options,
            bus,
            index,
            events,
        }
    }

    pub fn id(&self) -> &DomainId {
        self.spec.id()
    }

    pub fn full_name(&self) -> &str {
        self.spec.full_name()
    }

    pub fn full_instance_id(&self, id: &InstanceId) -> FullInstanceId {
        FullInstanceId::new(self.spec.id(), id)
    }

    pub fn spec(&self) -> &Arc<DomainSpec> {
        &self.spec
    }

    pub fn options(&self) -> &DomainOptions {
        &self.options
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Channel carrying `instance:tracked` / `instance:removed`.
    pub fn events(&self) -> &Channel {
        &self.events
    }

    /// Create a new instance with `initial` as its state and add it to the
    /// index.
    #[instrument(skip(self, initial), fields(domain = %self.spec.full_name()), err)]
    pub async fn create(&self, initial: Value, locale: Option<&str>) -> DomainResult<Instance> {
        let id: InstanceId = self.bus.unique_id("").parse().map_err(StoreError::from)?;
        let instance = self
            .open(id, 0, locale.map(str::to_string), self.options.writer)
            .await?;
        instance.initialize(initial).await?;

        let summary = instance.summary()?;
        self.index.push(instance.id(), summary.clone()).await?;
        self.notify(INSTANCE_TRACKED, json!({"id": instance.id(), "data": summary}))
            .await;

        info!(instance_id = %instance.id(), "instance created");
        Ok(instance)
    }

    /// Open an existing instance, replaying its log from `options.height`.
    #[instrument(skip(self, options), fields(domain = %self.spec.full_name(), instance_id = %id), err)]
    pub async fn load(&self, id: &InstanceId, options: LoadOptions) -> DomainResult<Instance> {
        let writer = options.writer.unwrap_or(self.options.writer);
        self.open(id.clone(), options.height, options.locale, writer)
            .await
    }

    /// Index entries of the instances matching `selector`.
    pub async fn find(&self, selector: &IndexSelector) -> DomainResult<Vec<IndexEntry>> {
        Ok(self.index.select(selector).await?)
    }

    /// Drop matching instances from the index and return what was removed.
    ///
    /// Logs are left in place; a removed instance can still be loaded.
    #[instrument(skip(self), fields(domain = %self.spec.full_name()), err)]
    pub async fn remove(&self, selector: &IndexSelector) -> DomainResult<Vec<IndexEntry>> {
        let mut removed = Vec::new();
        for entry in self.index.select(selector).await? {
            let Some(summary) = self.index.remove(&entry.id).await? else {
                continue;
            };
            self.notify(INSTANCE_REMOVED, removal_payload(&entry.id, &summary))
                .await;
            removed.push(IndexEntry {
                id: entry.id,
                summary,
            });
        }
        Ok(removed)
    }

    async fn open(
        &self,
        id: InstanceId,
        height: Height,
        locale: Option<String>,
        writer: bool,
    ) -> DomainResult<Instance> {
        let mut options = StoreOptions::default()
            .from_height(height)
            .locale(locale.unwrap_or_else(|| self.options.locale.clone()));
        options.snapshot_threshold = self.options.snapshot_threshold;
        if writer {
            options = options.writer(self.spec.mutations().clone());
        }

        Instance::open(&self.bus, self.spec.clone(), id, options).await
    }

    async fn notify(&self, key: &str, payload: Value) {
        if let Err(e) = self.events.publish(key, &payload).await {
            warn!(domain = %self.spec.full_name(), key, error = %e, "failed to publish domain event");
        }
    }
}

/// `{id, ...summary}` for object summaries, `{id, data}` otherwise.
fn removal_payload(id: &InstanceId, summary: &Value) -> Value {
    let mut payload = match summary {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut fields = Map::new();
            fields.insert("data".to_string(), other.clone());
            fields
        }
    };
    payload.insert("id".to_string(), Value::from(id.as_str()));
    Value::Object(payload)
}
