//! In-memory transport for tests/dev.
//!
//! Clones share the same streams and channels, so two clones behave like two
//! processes connected to the same backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::bus::{Feed, Subscription};
use crate::envelope::{ChannelMessage, EntryId, Fields, StreamEntry};
use crate::error::TransportError;
use crate::pattern::glob_match;
use crate::transport::{ChannelTransport, StreamTransport, TailFrom, ensure_group};

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Number of entries handed out to the group so far.
    delivered: usize,
    /// Entry id -> consumer it was delivered to.
    pending: HashMap<EntryId, String>,
}

#[derive(Debug)]
struct ChannelSubscriber {
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Debug)]
struct Shared {
    streams: Mutex<HashMap<String, StreamLog>>,
    /// Bumped on every append; blocked readers wait on it.
    appended: watch::Sender<u64>,
    subscribers: Mutex<Vec<ChannelSubscriber>>,
}

/// In-memory streams and channels.
///
/// - Blocking reads wake on append (no polling)
/// - Consumer groups track delivery and pending entries
/// - Channel fan-out drops subscribers that went away
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                appended,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a stream.
    pub fn len(&self, key: &str) -> usize {
        self.shared
            .lock_streams()
            .map(|streams| streams.get(key).map_or(0, |log| log.entries.len()))
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged entries of a group.
    pub fn pending(&self, key: &str, group: &str) -> usize {
        self.shared
            .lock_streams()
            .ok()
            .and_then(|streams| {
                streams
                    .get(key)
                    .and_then(|log| log.groups.get(group))
                    .map(|g| g.pending.len())
            })
            .unwrap_or(0)
    }
}

impl Shared {
    fn lock_streams(&self) -> Result<MutexGuard<'_, HashMap<String, StreamLog>>, TransportError> {
        self.streams
            .lock()
            .map_err(|_| TransportError::command("in-memory stream lock poisoned"))
    }

    fn entries_from(&self, key: &str, cursor: usize) -> Result<Vec<StreamEntry>, TransportError> {
        let streams = self.lock_streams()?;
        Ok(streams
            .get(key)
            .map(|log| log.entries.iter().skip(cursor).cloned().collect())
            .unwrap_or_default())
    }

    fn claim(&self, key: &str, group: &str, consumer: &str) -> Result<Vec<StreamEntry>, TransportError> {
        let mut streams = self.lock_streams()?;
        let log = streams.entry(key.to_string()).or_default();
        let Some(state) = log.groups.get_mut(group) else {
            return Err(TransportError::command(format!("no such consumer group {group} on {key}")));
        };

        let batch: Vec<StreamEntry> = log.entries.iter().skip(state.delivered).cloned().collect();
        state.delivered = log.entries.len();
        for entry in &batch {
            state.pending.insert(entry.id().clone(), consumer.to_string());
        }
        Ok(batch)
    }
}

async fn run_tail(shared: Arc<Shared>, key: String, mut cursor: usize, mut feed: Feed<Vec<StreamEntry>>) {
    let mut appended = shared.appended.subscribe();
    loop {
        let batch = match shared.entries_from(&key, cursor) {
            Ok(batch) => batch,
            Err(_) => return,
        };
        if !batch.is_empty() {
            cursor += batch.len();
            if !feed.send(batch) {
                return;
            }
            continue;
        }

        tokio::select! {
            changed = appended.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = feed.disposed() => return,
        }
    }
}

async fn run_consumer(
    shared: Arc<Shared>,
    key: String,
    group: String,
    consumer: String,
    mut feed: Feed<Vec<StreamEntry>>,
) {
    let mut appended = shared.appended.subscribe();
    loop {
        if feed.is_closed() {
            return;
        }
        let batch = match shared.claim(&key, &group, &consumer) {
            Ok(batch) => batch,
            Err(_) => return,
        };
        if !batch.is_empty() {
            if !feed.send(batch) {
                return;
            }
            continue;
        }

        tokio::select! {
            changed = appended.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = feed.disposed() => return,
        }
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn append(&self, key: &str, fields: Fields) -> Result<EntryId, TransportError> {
        let id = {
            let mut streams = self.shared.lock_streams()?;
            let log = streams.entry(key.to_string()).or_default();
            log.next_seq += 1;
            let id = EntryId::new(format!("{}-0", log.next_seq));
            log.entries.push(StreamEntry::new(id.clone(), fields));
            id
        };

        self.shared.appended.send_modify(|version| *version += 1);
        Ok(id)
    }

    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, TransportError> {
        self.shared.entries_from(key, 0)
    }

    fn tail(&self, key: &str, from: TailFrom) -> Subscription<Vec<StreamEntry>> {
        let (feed, subscription) = Subscription::channel();

        // Resolve the start position now so that nothing appended between
        // this call and the task starting is skipped.
        let cursor = self
            .shared
            .lock_streams()
            .map(|streams| {
                let entries = streams.get(key).map(|log| log.entries.as_slice()).unwrap_or(&[]);
                match &from {
                    TailFrom::Latest => entries.len(),
                    TailFrom::After(id) => entries.iter().take_while(|e| e.id() <= id).count(),
                }
            })
            .unwrap_or(0);

        tokio::spawn(run_tail(self.shared.clone(), key.to_string(), cursor, feed));
        subscription
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
        let mut streams = self.shared.lock_streams()?;
        let log = streams.entry(key.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Err(TransportError::GroupAlreadyExists {
                key: key.to_string(),
                group: group.to_string(),
            });
        }
        log.groups.insert(group.to_string(), GroupState::default());
        Ok(())
    }

    async fn consume(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Subscription<Vec<StreamEntry>>, TransportError> {
        ensure_group(self, key, group).await?;

        let (feed, subscription) = Subscription::channel();
        tokio::spawn(run_consumer(
            self.shared.clone(),
            key.to_string(),
            group.to_string(),
            consumer.to_string(),
            feed,
        ));
        Ok(subscription)
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<(), TransportError> {
        let mut streams = self.shared.lock_streams()?;
        if let Some(state) = streams.get_mut(key).and_then(|log| log.groups.get_mut(group)) {
            for id in ids {
                state.pending.remove(id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        let mut subs = self
            .shared
            .subscribers
            .lock()
            .map_err(|_| TransportError::command("in-memory subscriber lock poisoned"))?;

        // Drop any dead subscribers while publishing.
        subs.retain(|sub| {
            let Some(pattern) = sub.patterns.iter().find(|p| glob_match(p, channel)) else {
                return !sub.sender.is_closed();
            };
            sub.sender
                .send(ChannelMessage {
                    channel: channel.to_string(),
                    pattern: Some(pattern.clone()),
                    payload: payload.to_string(),
                })
                .is_ok()
        });

        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[String],
    ) -> Result<Subscription<ChannelMessage>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .map_err(|_| TransportError::command("in-memory subscriber lock poisoned"))?
            .push(ChannelSubscriber {
                patterns: patterns.to_vec(),
                sender,
            });

        Ok(Subscription::new(receiver))
    }
}
