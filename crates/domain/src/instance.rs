//! One live instance of a domain.

use std::sync::Arc;

use rfx_core::{FullInstanceId, Height, InstanceId};
use rfx_events::EntryId;
use rfx_store::{Bus, QueryFilter, QueryHandle, QueryOptions, Selector, Store, StoreOptions};
use serde_json::Value;

use crate::domain::DomainSpec;
use crate::effects::EffectsPipeline;
use crate::error::{DomainError, DomainResult};
use crate::view::INDEX_VIEW;

/// An instance and its store. Clones share both; the effects pipeline stops
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Instance {
    id: InstanceId,
    full_id: FullInstanceId,
    spec: Arc<DomainSpec>,
    store: Store,
    _effects: Option<Arc<EffectsPipeline>>,
}

impl core::fmt::Debug for Instance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Instance")
            .field("full_id", &self.full_id)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) async fn open(
        bus: &Bus,
        spec: Arc<DomainSpec>,
        id: InstanceId,
        options: StoreOptions,
    ) -> DomainResult<Self> {
        let full_id = FullInstanceId::new(spec.id(), &id);
        let store = bus.create_store(full_id.as_str(), options).await?;

        // Subscribed after replay: effects react to new transitions only.
        let effects = (!spec.effects().is_empty()).then(|| {
            Arc::new(EffectsPipeline::spawn(
                spec.effects().clone(),
                store.transitions(),
                bus.channel(effects_channel(&full_id)),
            ))
        });

        Ok(Self {
            id,
            full_id,
            spec,
            store,
            _effects: effects,
        })
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// `domain_id:instance_id`; also the store id.
    pub fn full_id(&self) -> &FullInstanceId {
        &self.full_id
    }

    /// Name of the channel effects are published on.
    pub fn effects_channel(&self) -> String {
        effects_channel(&self.full_id)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn height(&self) -> Height {
        self.store.height()
    }

    pub fn state(&self) -> Arc<Value> {
        self.store.state()
    }

    pub async fn initialize(&self, state: Value) -> DomainResult<Option<Height>> {
        Ok(self.store.init(state).await?)
    }

    /// Queue a mutation. Keys the domain does not know are rejected here,
    /// before anything is written.
    pub async fn mutate(&self, key: &str, payload: Value) -> DomainResult<EntryId> {
        if !self.spec.mutations().contains(key) {
            return Err(DomainError::UnknownMutation(key.to_string()));
        }
        Ok(self.store.mutate(key, payload).await?)
    }

    pub fn query(
        &self,
        selector: Selector,
        filter: Option<QueryFilter>,
        options: QueryOptions,
    ) -> QueryHandle {
        self.store.query(selector, filter, options)
    }

    /// The registered view `key`, bound to this instance.
    pub fn view(&self, key: &str) -> DomainResult<QueryHandle> {
        self.spec
            .view(key)
            .map(|view| view.resolve(&self.store))
            .ok_or_else(|| DomainError::UnknownView(key.to_string()))
    }

    /// What the domain index keeps for this instance: the `index` view when
    /// registered, the whole state otherwise.
    pub(crate) fn summary(&self) -> DomainResult<Value> {
        match self.spec.view(INDEX_VIEW) {
            Some(view) => Ok(view.resolve(&self.store).snapshot()?),
            None => Ok((*self.store.state()).clone()),
        }
    }

    /// Stop replicating and serving mutations. The last state stays readable.
    pub fn dispose(&self) {
        self.store.dispose();
    }
}

fn effects_channel(full_id: &FullInstanceId) -> String {
    format!("{full_id}:effects")
}
