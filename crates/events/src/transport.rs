//! Transport contracts for streams and channels.
//!
//! The store depends only on these traits; Redis (in `rfx-infra`) and the
//! in-memory transport (for tests/dev) implement them.
//!
//! ## Delivery Guarantees
//!
//! - `append`/`range`/`tail`: entries are totally ordered per stream key.
//! - `consume`: at-least-once; an entry stays pending in its group until
//!   `ack`ed, and each entry goes to exactly one consumer of the group.
//! - `publish`/`subscribe`: at-most-once, best effort, no persistence.

use async_trait::async_trait;

use crate::bus::Subscription;
use crate::envelope::{ChannelMessage, EntryId, Fields, StreamEntry};
use crate::error::TransportError;

/// Where a tail starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailFrom {
    /// Only entries appended after the tail started.
    Latest,
    /// Every entry strictly after this id.
    After(EntryId),
}

/// Ordered append-only logs.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry; returns its id once the backend acknowledged the write.
    async fn append(&self, key: &str, fields: Fields) -> Result<EntryId, TransportError>;

    /// Every entry of the stream, oldest first. Missing streams are empty.
    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, TransportError>;

    /// Continuous blocking read of new entries, delivered in batches.
    ///
    /// Never fails up front: connection failures are retried inside the
    /// producer, which resumes after the last delivered id.
    fn tail(&self, key: &str, from: TailFrom) -> Subscription<Vec<StreamEntry>>;

    /// Create a consumer group reading the stream from its beginning,
    /// creating the stream if needed.
    ///
    /// Fails with [`TransportError::GroupAlreadyExists`] when the group is
    /// already there.
    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError>;

    /// Deliver entries not yet delivered to `group`, as `consumer`.
    ///
    /// Ensures the group first; any failure other than "already exists" is
    /// returned. Entries stay pending until [`ack`](Self::ack)ed.
    async fn consume(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Vec<StreamEntry>>, TransportError>;

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<(), TransportError>;
}

/// Fire-and-forget pub/sub.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError>;

    /// Subscribe to every channel matching one of the glob `patterns`.
    async fn subscribe(
        &self,
        patterns: &[String],
    ) -> Result<Subscription<ChannelMessage>, TransportError>;
}

/// A backend providing both streams and channels.
pub trait Transport: StreamTransport + ChannelTransport {}

impl<T> Transport for T where T: StreamTransport + ChannelTransport + ?Sized {}

/// Create `group` on `key`, treating "already exists" as success.
///
/// Group creation races between processes are expected; every other failure
/// is returned to the caller.
pub async fn ensure_group<T>(transport: &T, key: &str, group: &str) -> Result<(), TransportError>
where
    T: StreamTransport + ?Sized,
{
    match transport.create_group(key, group).await {
        Ok(()) | Err(TransportError::GroupAlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
