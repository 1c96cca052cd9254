//! Redis-backed transport.
//!
//! - **Logs**: one Redis stream per key (`XADD`, `XRANGE`, `XREAD BLOCK`).
//! - **Consumer groups**: `XGROUP CREATE … MKSTREAM`, `XREADGROUP`, `XACK`.
//! - **Channels**: `PUBLISH` / `PSUBSCRIBE`.
//!
//! Short commands share one multiplexed connection, re-established lazily
//! after a connection failure. Every tail, consumer and channel subscription
//! owns a dedicated connection for its blocking reads, so disposing it closes
//! exactly that connection.

mod redis_pubsub;
mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, FromRedisValue, RedisError};
use rfx_events::{Feed, TransportError};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::{ReconnectPolicy, TransportConfig};

#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
    reconnect: ReconnectPolicy,
    shared: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl core::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// No connection is made until the first command.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| TransportError::unavailable(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            reconnect: config.reconnect,
            shared: Arc::new(Mutex::new(None)),
        })
    }

    pub fn from_env() -> Result<Self, TransportError> {
        let config =
            TransportConfig::from_env().map_err(|e| TransportError::unavailable(e.to_string()))?;
        Self::new(&config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    /// The shared connection, opening it if needed.
    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut shared = self.shared.lock().await;
        if let Some(conn) = shared.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.dedicated().await?;
        debug!("shared redis connection established");
        *shared = Some(conn.clone());
        Ok(conn)
    }

    /// A fresh connection for a blocking reader.
    async fn dedicated(&self) -> Result<MultiplexedConnection, TransportError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| classify(&e))
    }

    /// Run a short command on the shared connection.
    ///
    /// A connection-level failure drops the shared connection so the next
    /// command reconnects.
    #[instrument(skip(self, cmd), err)]
    async fn execute<T: FromRedisValue>(
        &self,
        name: &'static str,
        cmd: &redis::Cmd,
    ) -> Result<T, RedisCommandError> {
        let mut conn = self.connection().await?;
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if classify(&e).is_transient() {
                    *self.shared.lock().await = None;
                }
                Err(RedisCommandError::Redis(name, e))
            }
        }
    }
}

/// Failure of one command, before it is mapped to a [`TransportError`].
#[derive(Debug, thiserror::Error)]
enum RedisCommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0} failed: {1}")]
    Redis(&'static str, RedisError),
}

impl RedisCommandError {
    fn into_transport(self) -> TransportError {
        match self {
            Self::Transport(e) => e,
            Self::Redis(name, e) => match classify(&e) {
                TransportError::Command(msg) => TransportError::command(format!("{name}: {msg}")),
                other => other,
            },
        }
    }

    fn is_busy_group(&self) -> bool {
        matches!(self, Self::Redis(_, e) if e.code() == Some("BUSYGROUP"))
    }
}

/// Map a Redis error onto the transport error model.
///
/// Connection-level failures are [`TransportError::Unavailable`] so that
/// long-running loops retry them; everything else is a rejected command.
pub(crate) fn classify(e: &RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        return TransportError::unavailable(e.to_string());
    }
    match e.kind() {
        ErrorKind::TypeError => TransportError::Serialization(e.to_string()),
        ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::ClusterDown | ErrorKind::MasterDown => {
            TransportError::unavailable(e.to_string())
        }
        _ => TransportError::command(e.to_string()),
    }
}

/// Wait out one backoff step unless the subscriber goes away first.
///
/// Returns `false` when the subscriber is gone; otherwise doubles `delay`.
pub(crate) async fn backoff<M>(
    feed: &mut Feed<M>,
    delay: &mut Duration,
    policy: &ReconnectPolicy,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(*delay) => {}
        _ = feed.disposed() => return false,
    }
    *delay = policy.next_delay(*delay);
    true
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn connection_failures_are_transient() {
        let refused = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(classify(&refused).is_transient());

        let reset = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(classify(&reset), TransportError::Unavailable(_)));
    }

    #[test]
    fn rejected_commands_are_not_retried() {
        let wrong_type = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(matches!(classify(&wrong_type), TransportError::Command(_)));
        assert!(!classify(&wrong_type).is_transient());

        let decode = RedisError::from((ErrorKind::TypeError, "not a stream reply"));
        assert!(matches!(classify(&decode), TransportError::Serialization(_)));
    }

    #[test]
    fn only_busygroup_means_the_group_exists() {
        let other = RedisCommandError::Redis(
            "XGROUP CREATE",
            RedisError::from((ErrorKind::ResponseError, "NOGROUP")),
        );
        assert!(!other.is_busy_group());
        assert!(matches!(other.into_transport(), TransportError::Command(msg) if msg.starts_with("XGROUP CREATE")));
    }

    #[test]
    fn transport_config_is_validated_without_connecting() {
        let config = TransportConfig {
            redis_url: "not a url".to_string(),
            ..TransportConfig::default()
        };
        assert!(RedisTransport::new(&config).is_err());
        assert!(RedisTransport::new(&TransportConfig::default()).is_ok());
    }
}
