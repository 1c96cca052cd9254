//! `rfx-store`: log-backed instance state.
//!
//! A [`Store`] derives its state by replaying the frames of an append-only
//! log and keeps it current by tailing that log. Writes never touch the state
//! directly: callers post mutation requests, and the single writer process
//! (the one that opened the store with [`StoreOptions::writer`]) turns each
//! request into a frame.
//!
//! ```text
//! mutate() → <id>:requests ──(group "mutators")──► writer: mutator → diff → frame
//!                                                               │
//!            every replica ◄── tail ◄── <id>:frames ◄───────────┘
//! ```
//!
//! Running more than one writer for the same store is an operational error:
//! nothing here elects a leader or fences a stale writer.

pub mod bus;
pub mod error;
pub mod query;
pub mod request;
pub mod store;

mod tailing;
mod writer;

pub use bus::{Bus, Channel, ChannelEvent, RequestStream};
pub use error::{QueryError, StoreError, StoreResult};
pub use query::{
    DocumentQuery, PathExpr, QueryFilter, QueryHandle, QueryOptions, Selector, SortDirection,
    SortKey,
};
pub use request::{MutationArgs, Request};
pub use store::{
    DEFAULT_LOCALE, DEFAULT_SNAPSHOT_THRESHOLD, MUTATORS_GROUP, MutationContext, MutationTable,
    MutatorFn, Store, StoreOptions, Transition,
};
