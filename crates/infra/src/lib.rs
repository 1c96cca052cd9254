//! Infrastructure layer: the Redis transport and its configuration.
//!
//! The transport contracts live in `rfx-events` as pure mechanics; this crate
//! maps them onto Redis Streams (logs, consumer groups) and Redis pub/sub
//! (channels).

pub mod config;

#[cfg(feature = "redis")]
pub mod transport;

pub use config::{ConfigError, ReconnectPolicy, TransportConfig};

#[cfg(feature = "redis")]
pub use transport::RedisTransport;
