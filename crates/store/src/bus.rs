//! The bus: one handle onto a transport, handing out stores, request
//! streams and notification channels.

use std::sync::Arc;

use rfx_events::{
    ChannelTransport, EntryId, StreamEntry, StreamTransport, Subscription, Transport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::StoreResult;
use crate::request::encode_fields;
use crate::store::{Store, StoreOptions};

/// Cheap to clone; every clone shares the transport.
#[derive(Clone)]
pub struct Bus {
    transport: Arc<dyn Transport>,
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

impl Bus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// `prefix` followed by a fresh 64 character hex id.
    pub fn unique_id(&self, prefix: &str) -> String {
        rfx_core::unique_id(prefix)
    }

    /// Open the store named `id`: replay its log, start tailing it and, when
    /// `options` designate this process as writer, start serving mutations.
    ///
    /// The returned store is fully replayed.
    pub async fn create_store(&self, id: &str, options: StoreOptions) -> StoreResult<Store> {
        Store::open(self.clone(), id, options).await
    }

    pub fn stream(&self, key: impl Into<String>) -> RequestStream {
        RequestStream {
            transport: self.transport.clone(),
            key: key.into(),
        }
    }

    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel {
            transport: self.transport.clone(),
            name: name.into(),
        }
    }

    /// Channel events from every channel matching one of the glob `patterns`.
    pub async fn subscribe(&self, patterns: &[String]) -> StoreResult<Subscription<ChannelEvent>> {
        let mut messages = self.transport.subscribe(patterns).await?;
        let (mut feed, subscription) = Subscription::channel();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = messages.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                    _ = feed.disposed() => return,
                };

                match serde_json::from_str::<ChannelPayload>(&message.payload) {
                    Ok(payload) => {
                        let event = ChannelEvent {
                            channel: message.channel,
                            key: payload.key,
                            payload: payload.payload,
                        };
                        if !feed.send(event) {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %message.channel, error = %e, "dropping undecodable channel message");
                    }
                }
            }
        });

        Ok(subscription)
    }
}

/// A request stream (append side plus consumer-group side).
#[derive(Clone)]
pub struct RequestStream {
    transport: Arc<dyn Transport>,
    key: String,
}

impl RequestStream {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a request of type `kind`; resolves once the transport accepted it.
    #[instrument(skip(self, args), fields(stream = %self.key), err)]
    pub async fn post(&self, kind: &str, args: &Value) -> StoreResult<EntryId> {
        Ok(self.transport.append(&self.key, encode_fields(kind, args)).await?)
    }

    /// Join consumer group `group` as `consumer`.
    pub async fn consume(
        &self,
        group: &str,
        consumer: &str,
    ) -> StoreResult<Subscription<Vec<StreamEntry>>> {
        Ok(self.transport.consume(&self.key, group, consumer).await?)
    }

    pub async fn ack(&self, group: &str, ids: &[EntryId]) -> StoreResult<()> {
        Ok(self.transport.ack(&self.key, group, ids).await?)
    }
}

/// A named notification channel.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn Transport>,
    name: String,
}

/// Wire shape of a channel message.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelPayload {
    key: String,
    #[serde(default)]
    payload: Value,
}

/// An event received from a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub channel: String,
    pub key: String,
    pub payload: Value,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best effort: delivered to current subscribers only.
    pub async fn publish(&self, key: &str, payload: &Value) -> StoreResult<()> {
        let body = serde_json::to_string(&ChannelPayload {
            key: key.to_string(),
            payload: payload.clone(),
        })?;
        Ok(self.transport.publish(&self.name, &body).await?)
    }

    pub async fn subscribe(&self) -> StoreResult<Subscription<ChannelEvent>> {
        Bus::new(self.transport.clone())
            .subscribe(&[escape_glob(&self.name)])
            .await
    }
}

fn escape_glob(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rfx_events::InMemoryTransport;
    use serde_json::json;

    use super::*;

    fn bus() -> Bus {
        Bus::new(Arc::new(InMemoryTransport::new()))
    }

    #[test]
    fn unique_ids_are_prefixed() {
        let id = bus().unique_id("order-");
        assert!(id.starts_with("order-"));
        assert_eq!(id.len(), 6 + 64);
    }

    #[tokio::test]
    async fn channel_events_round_trip_key_and_payload() {
        let bus = bus();
        let channel = bus.channel("d1:i1:effects");
        let mut events = channel.subscribe().await.unwrap();

        channel.publish("order:activated", &json!({"id": 1})).await.unwrap();

        let event = events.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(event.channel, "d1:i1:effects");
        assert_eq!(event.key, "order:activated");
        assert_eq!(event.payload, json!({"id": 1}));
    }

    #[tokio::test]
    async fn posted_requests_reach_consumers() {
        let bus = bus();
        let stream = bus.stream("s:requests");
        stream.post("mutate", &json!({"key": "k"})).await.unwrap();

        let mut consumer = stream.consume("mutators", "c").await.unwrap();
        let batch = consumer.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch[0].field("type"), Some("mutate"));

        stream.ack("mutators", &[batch[0].id().clone()]).await.unwrap();
    }

    #[test]
    fn glob_characters_in_channel_names_are_escaped() {
        assert_eq!(escape_glob("a:*"), r"a:\*");
        assert_eq!(escape_glob("plain:name"), "plain:name");
    }
}
