//! `rfx-events`: transport mechanics for instance logs and notifications.
//!
//! Two primitives, both transport-agnostic:
//!
//! - **Streams**: ordered, append-only logs with range reads, blocking tails
//!   and consumer groups (at-least-once, one consumer per entry).
//! - **Channels**: fire-and-forget pub/sub with glob pattern subscriptions.
//!
//! Everything a caller receives asynchronously arrives through a
//! [`Subscription`]; dropping it stops the producer behind it.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod in_memory_bus;
pub mod pattern;
pub mod transport;

pub use bus::{Feed, RecvTimeoutError, Subscription};
pub use envelope::{ChannelMessage, EntryId, Fields, StreamEntry};
pub use error::TransportError;
pub use in_memory_bus::InMemoryTransport;
pub use transport::{ChannelTransport, StreamTransport, TailFrom, Transport, ensure_group};
