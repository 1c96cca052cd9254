//! Redis Streams side of the transport: logs and consumer groups.

use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use rfx_events::{
    EntryId, Feed, Fields, StreamEntry, StreamTransport, Subscription, TailFrom, TransportError,
    ensure_group,
};
use tracing::{debug, instrument, warn};

use super::{RedisTransport, backoff, classify};

/// Where a blocking read resumes.
#[derive(Debug, Clone)]
enum ReadMode {
    /// `XREAD … STREAMS key <cursor>`; the cursor follows delivered entries.
    Tail { cursor: String },
    /// `XREADGROUP GROUP group consumer … STREAMS key >`.
    Group { group: String, consumer: String },
}

impl ReadMode {
    fn command(&self, key: &str) -> redis::Cmd {
        match self {
            Self::Tail { cursor } => {
                let mut cmd = redis::cmd("XREAD");
                cmd.arg("BLOCK").arg(0).arg("STREAMS").arg(key).arg(cursor);
                cmd
            }
            Self::Group { group, consumer } => {
                let mut cmd = redis::cmd("XREADGROUP");
                cmd.arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("BLOCK")
                    .arg(0)
                    .arg("STREAMS")
                    .arg(key)
                    .arg(">");
                cmd
            }
        }
    }

    fn advance(&mut self, entries: &[StreamEntry]) {
        if let (Self::Tail { cursor }, Some(last)) = (self, entries.last()) {
            *cursor = last.id().as_str().to_string();
        }
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    #[instrument(skip(self, fields), err)]
    async fn append(&self, key: &str, fields: Fields) -> Result<EntryId, TransportError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (name, value) in &fields {
            cmd.arg(name).arg(value);
        }

        let id: String = self
            .execute("XADD", &cmd)
            .await
            .map_err(|e| e.into_transport())?;
        Ok(EntryId::new(id))
    }

    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, TransportError> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg("-").arg("+");

        let reply: StreamRangeReply = self
            .execute("XRANGE", &cmd)
            .await
            .map_err(|e| e.into_transport())?;
        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    fn tail(&self, key: &str, from: TailFrom) -> Subscription<Vec<StreamEntry>> {
        let cursor = match from {
            TailFrom::Latest => "$".to_string(),
            TailFrom::After(id) => id.as_str().to_string(),
        };
        let (feed, subscription) = Subscription::channel();
        tokio::spawn(read_loop(
            self.clone(),
            key.to_string(),
            ReadMode::Tail { cursor },
            feed,
        ));
        subscription
    }

    #[instrument(skip(self), err)]
    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(key).arg(group).arg("0").arg("MKSTREAM");

        match self.execute::<()>("XGROUP CREATE", &cmd).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_busy_group() => Err(TransportError::GroupAlreadyExists {
                key: key.to_string(),
                group: group.to_string(),
            }),
            Err(e) => Err(e.into_transport()),
        }
    }

    async fn consume(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Vec<StreamEntry>>, TransportError> {
        ensure_group(self, key, group).await?;

        let (feed, subscription) = Subscription::channel();
        tokio::spawn(read_loop(
            self.clone(),
            key.to_string(),
            ReadMode::Group {
                group: group.to_string(),
                consumer: consumer.to_string(),
            },
            feed,
        ));
        Ok(subscription)
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<(), TransportError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(key).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }

        let _acked: u64 = self
            .execute("XACK", &cmd)
            .await
            .map_err(|e| e.into_transport())?;
        Ok(())
    }
}

/// Blocking read loop behind `tail` and `consume`.
///
/// Runs until the subscriber is gone. Connection failures are retried with
/// backoff on a fresh connection; a tail resumes after the last delivered id.
async fn read_loop(
    transport: RedisTransport,
    key: String,
    mut mode: ReadMode,
    mut feed: Feed<Vec<StreamEntry>>,
) {
    let policy = transport.reconnect_policy();
    let mut delay = policy.base_delay;

    loop {
        match connect_reader(&transport, &key, &mode).await {
            Ok(mut conn) => {
                let failure = read_batches(&mut conn, &key, &mut mode, &mut feed).await;
                let Some((err, delivered)) = failure else {
                    debug!(key = %key, "stream reader stopped");
                    return;
                };
                if delivered {
                    delay = policy.base_delay;
                }
                warn!(key = %key, error = %err, retry_in = ?delay, "stream read failed; reconnecting");
            }
            Err(e) => {
                warn!(key = %key, error = %e, retry_in = ?delay, "stream reader cannot connect");
            }
        }

        if !backoff(&mut feed, &mut delay, &policy).await {
            return;
        }
    }
}

/// A dedicated connection for `mode`; group readers re-ensure their group,
/// which may be gone after a server restart.
async fn connect_reader(
    transport: &RedisTransport,
    key: &str,
    mode: &ReadMode,
) -> Result<MultiplexedConnection, TransportError> {
    if let ReadMode::Group { group, .. } = mode {
        ensure_group(transport, key, group).await?;
    }
    transport.dedicated().await
}

/// Deliver batches until the subscriber goes away (`None`) or a read fails.
///
/// On failure, also reports whether any read succeeded on this connection.
async fn read_batches(
    conn: &mut MultiplexedConnection,
    key: &str,
    mode: &mut ReadMode,
    feed: &mut Feed<Vec<StreamEntry>>,
) -> Option<(TransportError, bool)> {
    let mut delivered = false;
    loop {
        let cmd = mode.command(key);
        let reply: RedisResult<Option<StreamReadReply>> = tokio::select! {
            reply = cmd.query_async::<_, Option<StreamReadReply>>(conn) => reply,
            _ = feed.disposed() => return None,
        };

        let entries = match reply {
            Ok(reply) => entries_of(reply),
            Err(e) => return Some((classify(&e), delivered)),
        };
        delivered = true;
        if entries.is_empty() {
            continue;
        }

        mode.advance(&entries);
        if !feed.send(entries) {
            return None;
        }
    }
}

fn entries_of(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    reply
        .map(|reply| {
            reply
                .keys
                .into_iter()
                .flat_map(|stream| stream.ids)
                .map(to_entry)
                .collect()
        })
        .unwrap_or_default()
}

/// Redis returns entry fields as a map; they are delivered sorted by name.
/// Fields whose value is not a string are dropped.
pub(crate) fn to_entry(raw: StreamId) -> StreamEntry {
    let mut fields: Fields = raw
        .map
        .iter()
        .filter_map(|(name, value)| match redis::from_redis_value::<String>(value) {
            Ok(value) => Some((name.clone(), value)),
            Err(e) => {
                warn!(entry_id = %raw.id, field = %name, error = %e, "dropping non-string field");
                None
            }
        })
        .collect();
    fields.sort();
    StreamEntry::new(EntryId::new(raw.id), fields)
}
