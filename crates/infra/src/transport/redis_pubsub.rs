//! Redis pub/sub side of the transport.
//!
//! Pub/sub is not durable: messages published while a subscriber is
//! reconnecting are lost.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::PubSub;
use rfx_events::{ChannelMessage, ChannelTransport, Feed, Subscription, TransportError};
use tracing::{debug, instrument, warn};

use super::{RedisTransport, backoff, classify};

#[async_trait]
impl ChannelTransport for RedisTransport {
    #[instrument(skip(self, payload), err)]
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);

        let receivers: i64 = self
            .execute("PUBLISH", &cmd)
            .await
            .map_err(|e| e.into_transport())?;
        debug!(channel, receivers, "published");
        Ok(())
    }

    /// The first connection is made here, so an unreachable server fails
    /// the call; later disconnects are retried in the background.
    async fn subscribe(
        &self,
        patterns: &[String],
    ) -> Result<Subscription<ChannelMessage>, TransportError> {
        let pubsub = open_pubsub(self, patterns).await?;

        let (feed, subscription) = Subscription::channel();
        tokio::spawn(subscribe_loop(self.clone(), patterns.to_vec(), pubsub, feed));
        Ok(subscription)
    }
}

async fn open_pubsub(transport: &RedisTransport, patterns: &[String]) -> Result<PubSub, TransportError> {
    let mut pubsub = transport
        .client
        .get_async_pubsub()
        .await
        .map_err(|e| classify(&e))?;
    for pattern in patterns {
        pubsub.psubscribe(pattern).await.map_err(|e| classify(&e))?;
    }
    Ok(pubsub)
}

async fn subscribe_loop(
    transport: RedisTransport,
    patterns: Vec<String>,
    pubsub: PubSub,
    mut feed: Feed<ChannelMessage>,
) {
    let policy = transport.reconnect_policy();
    let mut delay = policy.base_delay;
    let mut connected = Some(pubsub);

    loop {
        if let Some(pubsub) = connected.take() {
            if !forward(pubsub, &mut feed).await {
                debug!(?patterns, "channel subscription stopped");
                return;
            }
            delay = policy.base_delay;
            warn!(?patterns, retry_in = ?delay, "pub/sub connection lost; resubscribing");
        }

        if !backoff(&mut feed, &mut delay, &policy).await {
            return;
        }

        match open_pubsub(&transport, &patterns).await {
            Ok(pubsub) => connected = Some(pubsub),
            Err(e) => warn!(?patterns, error = %e, retry_in = ?delay, "cannot resubscribe"),
        }
    }
}

/// Forward messages until the connection ends (`true`) or the subscriber is
/// gone (`false`).
async fn forward(pubsub: PubSub, feed: &mut Feed<ChannelMessage>) -> bool {
    let mut messages = pubsub.into_on_message();
    loop {
        let message = tokio::select! {
            message = messages.next() => message,
            _ = feed.disposed() => return false,
        };
        let Some(message) = message else {
            return true;
        };

        match to_channel_message(&message) {
            Ok(message) => {
                if !feed.send(message) {
                    return false;
                }
            }
            Err(e) => {
                warn!(channel = %message.get_channel_name(), error = %e, "dropping undecodable message");
            }
        }
    }
}

fn to_channel_message(message: &redis::Msg) -> Result<ChannelMessage, TransportError> {
    let payload: String = message
        .get_payload()
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    let pattern: Option<String> = message
        .get_pattern()
        .map_err(|e| TransportError::Serialization(e.to_string()))?;

    Ok(ChannelMessage {
        channel: message.get_channel_name().to_string(),
        pattern,
        payload,
    })
}
