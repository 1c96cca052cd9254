//! `rfx-domain`: domains and their instances.
//!
//! A [`Domain`] is assembled once through a [`DomainBuilder`] (mutations,
//! effects, views, schemas, mountpoints) and then frozen. At runtime it
//! creates and loads [`Instance`]s, each backed by one replicated store, and
//! keeps a summary of every live instance in an [`InstanceIndex`].
//!
//! ```text
//! DomainBuilder ──build──► Domain ──create/load──► Instance ──► Store
//!                            │                        │
//!                            ▼                        ▼
//!                     InstanceIndex           effects pipeline → <full_id>:effects
//! ```

pub mod builder;
pub mod domain;
pub mod effects;
pub mod error;
pub mod index;
pub mod instance;
pub mod view;

pub use builder::DomainBuilder;
pub use domain::{
    DEFAULT_SYSTEM, Domain, DomainOptions, DomainSpec, LoadOptions, SchemaKind, SchemaSpec,
    INSTANCE_REMOVED, INSTANCE_TRACKED,
};
pub use effects::{Effect, EffectMessage};
pub use error::{DomainError, DomainResult};
pub use index::{InMemoryInstanceIndex, IndexEntry, IndexError, IndexSelector, InstanceIndex};
pub use instance::Instance;
pub use view::ViewSpec;
