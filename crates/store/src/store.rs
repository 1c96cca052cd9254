//! The store: state derived from an append-only log of frames.
//!
//! Lifecycle: `open` replays the log (bootstrapping), then a background task
//! tails it and applies new frames as they arrive. Three paths apply frames:
//! replay/tail, `init`, and the writer loop. They share one async lock, so
//! frame application for a store never races with itself and the writer
//! handles one request fully (mutate → diff → append → apply) before the next.
//!
//! Queries read an immutable snapshot (`Arc<Value>`) and never wait on I/O,
//! so a store keeps serving its last known state while the transport is down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rfx_core::{Frame, Height, apply_patches, diff};
use rfx_events::{EntryId, StreamEntry, StreamTransport, Subscription, TailFrom};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::Bus;
use crate::error::{StoreError, StoreResult};
use crate::query::{QueryFilter, QueryHandle, QueryOptions, Selector};
use crate::request::{MUTATE, MutationArgs};
use crate::{tailing, writer};

/// Consumer group the writer reads mutation requests with.
pub const MUTATORS_GROUP: &str = "mutators";

pub const DEFAULT_LOCALE: &str = "en-US";

pub const DEFAULT_SNAPSHOT_THRESHOLD: usize = 50;

/// A mutator edits a draft copy of the state in place.
///
/// The frame written is the diff between the state before and the draft
/// after; a mutator that changes nothing writes nothing.
pub type MutatorFn =
    dyn Fn(&mut Value, &Value, &MutationContext) -> anyhow::Result<()> + Send + Sync;

/// What a mutator knows about the store it runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationContext {
    pub store_id: String,
    pub instance_id: String,
    pub locale: String,
    /// Height of the state the mutator is editing.
    pub height: Height,
}

/// Mutators by key.
#[derive(Clone, Default)]
pub struct MutationTable {
    mutators: HashMap<String, Arc<MutatorFn>>,
}

impl MutationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, key: impl Into<String>, mutator: F)
    where
        F: Fn(&mut Value, &Value, &MutationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.mutators.insert(key.into(), Arc::new(mutator));
    }

    pub fn get(&self, key: &str) -> Option<&Arc<MutatorFn>> {
        self.mutators.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.mutators.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mutators.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }
}

impl core::fmt::Debug for MutationTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("MutationTable").field("keys", &keys).finish()
    }
}

/// How to open a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Frames at or below this height are skipped during replay (the initial
    /// frame at height 0 is always applied).
    pub height: Height,
    pub locale: String,
    /// Replays longer than this many frames are reported.
    pub snapshot_threshold: usize,
    /// Mutators to serve requests with. Set on exactly one process per store.
    pub writer: Option<Arc<MutationTable>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            height: 0,
            locale: DEFAULT_LOCALE.to_string(),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            writer: None,
        }
    }
}

impl StoreOptions {
    pub fn writer(mut self, mutations: Arc<MutationTable>) -> Self {
        self.writer = Some(mutations);
        self
    }

    pub fn from_height(mut self, height: Height) -> Self {
        self.height = height;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }
}

/// One applied frame with the states on both sides of it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub height: Height,
    pub old: Arc<Value>,
    pub new: Arc<Value>,
    pub frame: Arc<Frame>,
}

#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    /// `None` until the first frame is applied.
    pub(crate) height: Option<Height>,
    pub(crate) state: Arc<Value>,
}

pub(crate) struct StoreInner {
    pub(crate) id: String,
    instance_id: String,
    locale: String,
    bus: Bus,
    frames_key: String,
    requests_key: String,
    pub(crate) apply_lock: tokio::sync::Mutex<()>,
    snapshot: RwLock<Snapshot>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Transition>>>,
}

/// A replicated, log-backed instance state.
///
/// Clones share the same state and background tasks; the tasks stop when
/// the last clone is dropped or [`dispose`](Store::dispose) is called.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

pub(crate) fn frames_key(id: &str) -> String {
    format!("{id}:frames")
}

pub(crate) fn requests_key(id: &str) -> String {
    format!("{id}:requests")
}

impl Store {
    #[instrument(skip(bus, options), fields(store_id = %id, from_height = options.height, writer = options.writer.is_some()), err)]
    pub(crate) async fn open(bus: Bus, id: &str, options: StoreOptions) -> StoreResult<Self> {
        let inner = Arc::new(StoreInner {
            id: id.to_string(),
            instance_id: id.rsplit(':').next().unwrap_or(id).to_string(),
            locale: options.locale.clone(),
            bus: bus.clone(),
            frames_key: frames_key(id),
            requests_key: requests_key(id),
            apply_lock: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Snapshot {
                height: None,
                state: Arc::new(json!({})),
            }),
            watchers: Mutex::new(Vec::new()),
        });
        let (shutdown, _) = watch::channel(false);

        let last_entry = inner.replay(options.height, options.snapshot_threshold).await?;

        // Tail from the last replayed entry so nothing appended in between is missed.
        let tail = bus
            .transport()
            .tail(&inner.frames_key, TailFrom::After(last_entry.unwrap_or_else(EntryId::origin)));
        tokio::spawn(tailing::run(inner.clone(), tail, shutdown.subscribe()));

        if let Some(mutations) = options.writer {
            let consumer = bus.unique_id("writer-");
            let requests = bus
                .stream(inner.requests_key.clone())
                .consume(MUTATORS_GROUP, &consumer)
                .await?;
            info!(store_id = %id, consumer = %consumer, mutations = mutations.len(), "serving mutations");
            tokio::spawn(writer::run(
                inner.clone(),
                mutations,
                requests,
                shutdown.subscribe(),
            ));
        }

        Ok(Self {
            inner,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn locale(&self) -> &str {
        &self.inner.locale
    }

    pub fn frames_key(&self) -> &str {
        &self.inner.frames_key
    }

    pub fn requests_key(&self) -> &str {
        &self.inner.requests_key
    }

    /// Height of the last applied frame (0 before any frame).
    pub fn height(&self) -> Height {
        self.inner.snapshot().height.unwrap_or(0)
    }

    /// Current state.
    pub fn state(&self) -> Arc<Value> {
        self.inner.snapshot().state
    }

    /// Write the initial state frame (height 0).
    ///
    /// Returns the written height, or `None` when `initial` is empty and
    /// there was nothing to write.
    #[instrument(skip(self, initial), fields(store_id = %self.inner.id), err)]
    pub async fn init(&self, initial: Value) -> StoreResult<Option<Height>> {
        let _guard = self.inner.apply_lock.lock().await;
        if self.inner.snapshot().height.is_some() {
            return Err(StoreError::AlreadyInitialized(self.inner.id.clone()));
        }

        let patches = diff(&json!({}), &initial);
        if patches.is_empty() {
            debug!(store_id = %self.inner.id, "empty initial state; nothing to write");
            return Ok(None);
        }

        let frame = Frame::new(0, patches);
        self.inner.append_frame(&frame).await?;
        self.inner.apply_frame(frame);
        Ok(Some(0))
    }

    /// Post a mutation request.
    ///
    /// Resolves once the request is durably queued, not once it is applied;
    /// use [`wait_for_height`](Store::wait_for_height) or a query stream to
    /// observe the result.
    pub async fn mutate(&self, key: &str, payload: Value) -> StoreResult<EntryId> {
        let args = serde_json::to_value(MutationArgs {
            key: key.to_string(),
            payload,
        })?;
        self.inner
            .bus
            .stream(self.inner.requests_key.clone())
            .post(MUTATE, &args)
            .await
    }

    /// A reactive view over `selector(state)`, optionally filtered.
    pub fn query(
        &self,
        selector: Selector,
        filter: Option<QueryFilter>,
        options: QueryOptions,
    ) -> QueryHandle {
        QueryHandle::new(self.inner.clone(), selector, filter, options)
    }

    /// Every transition applied from now on, in application order.
    pub fn transitions(&self) -> Subscription<Transition> {
        self.inner.subscribe_transitions()
    }

    /// Wait until the local height reaches `height`.
    pub async fn wait_for_height(&self, height: Height) -> StoreResult<()> {
        let mut transitions = self.inner.subscribe_transitions();
        if self.inner.snapshot().height.is_some_and(|h| h >= height) {
            return Ok(());
        }
        while let Some(transition) = transitions.recv().await {
            if transition.height >= height {
                return Ok(());
            }
        }
        Err(StoreError::Closed(self.inner.id.clone()))
    }

    /// Stop tailing and serving mutations. The last state stays readable.
    pub fn dispose(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl StoreInner {
    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn requests_key(&self) -> &str {
        &self.requests_key
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn subscribe_transitions(&self) -> Subscription<Transition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription::new(rx)
    }

    pub(crate) fn context(&self, height: Height) -> MutationContext {
        MutationContext {
            store_id: self.id.clone(),
            instance_id: self.instance_id.clone(),
            locale: self.locale.clone(),
            height,
        }
    }

    /// Read the whole log and apply what is applicable from `from_height`.
    ///
    /// Returns the id of the last log entry seen, applied or not.
    async fn replay(&self, from_height: Height, threshold: usize) -> StoreResult<Option<EntryId>> {
        let entries = self.bus.transport().range(&self.frames_key).await?;
        let last = entries.last().map(|e| e.id().clone());

        let mut frames: Vec<Frame> = entries
            .iter()
            .filter_map(|entry| self.decode_frame(entry))
            .filter(|frame| frame.height > from_height || frame.height == 0)
            .collect();
        frames.sort_by_key(|frame| frame.height);

        if frames.len() > threshold {
            warn!(
                store_id = %self.id,
                frames = frames.len(),
                threshold,
                "replayed more frames than the snapshot threshold"
            );
        }

        let _guard = self.apply_lock.lock().await;
        let applied = frames
            .into_iter()
            .filter(|frame| self.is_applicable(frame.height))
            .map(|frame| self.apply_frame(frame))
            .count();

        debug!(store_id = %self.id, applied, height = ?self.snapshot().height, "replay complete");
        Ok(last)
    }

    pub(crate) fn decode_frame(&self, entry: &StreamEntry) -> Option<Frame> {
        let Some(raw) = entry.field(Frame::FIELD) else {
            warn!(store_id = %self.id, entry_id = %entry.id(), "log entry without frame field");
            return None;
        };
        match Frame::decode(raw) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(store_id = %self.id, entry_id = %entry.id(), error = %e, "skipping undecodable frame");
                None
            }
        }
    }

    pub(crate) fn is_applicable(&self, height: Height) -> bool {
        self.snapshot().height.is_none_or(|current| height > current)
    }

    pub(crate) async fn append_frame(&self, frame: &Frame) -> StoreResult<EntryId> {
        let fields = vec![(Frame::FIELD.to_string(), frame.encode()?)];
        Ok(self.bus.transport().append(&self.frames_key, fields).await?)
    }

    /// Apply one frame. Caller holds `apply_lock`.
    ///
    /// A frame that does not apply cleanly leaves the state untouched but
    /// still advances the height, so replication carries on past it.
    pub(crate) fn apply_frame(&self, frame: Frame) {
        if !self.is_applicable(frame.height) {
            debug!(store_id = %self.id, height = frame.height, "frame already applied");
            return;
        }

        let old = self.snapshot().state;
        let mut next = (*old).clone();
        if let Err(e) = apply_patches(&mut next, &frame.patches) {
            error!(
                store_id = %self.id,
                height = frame.height,
                error = %e,
                "frame does not apply; state left unchanged"
            );
            self.set_snapshot(Snapshot {
                height: Some(frame.height),
                state: old,
            });
            return;
        }

        let new = Arc::new(next);
        self.set_snapshot(Snapshot {
            height: Some(frame.height),
            state: new.clone(),
        });
        debug!(store_id = %self.id, height = frame.height, patches = frame.patches.len(), "frame applied");

        self.notify(Transition {
            height: frame.height,
            old,
            new,
            frame: Arc::new(frame),
        });
    }

    fn set_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn notify(&self, transition: Transition) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| tx.send(transition.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;
    use rfx_core::Patch;
    use rfx_events::{ChannelMessage, ChannelTransport, Fields, InMemoryTransport, TransportError};

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn bus() -> (Bus, InMemoryTransport) {
        let transport = InMemoryTransport::new();
        (Bus::new(Arc::new(transport.clone())), transport)
    }

    /// In-memory transport that can be taken down, or made to drop the next
    /// frame appends.
    #[derive(Clone, Default)]
    struct FlakyTransport {
        inner: InMemoryTransport,
        down: Arc<AtomicBool>,
        failing_frame_appends: Arc<AtomicUsize>,
    }

    impl FlakyTransport {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn fail_frame_appends(&self, count: usize) {
            self.failing_frame_appends.store(count, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::unavailable("connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StreamTransport for FlakyTransport {
        async fn append(&self, key: &str, fields: Fields) -> Result<EntryId, TransportError> {
            self.check()?;
            let fail = key.ends_with(":frames")
                && self
                    .failing_frame_appends
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                return Err(TransportError::unavailable("append timed out"));
            }
            self.inner.append(key, fields).await
        }

        async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, TransportError> {
            self.check()?;
            self.inner.range(key).await
        }

        fn tail(&self, key: &str, from: TailFrom) -> Subscription<Vec<StreamEntry>> {
            self.inner.tail(key, from)
        }

        async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
            self.check()?;
            self.inner.create_group(key, group).await
        }

        async fn consume(
            &self,
            key: &str,
            group: &str,
            consumer: &str,
        ) -> Result<Subscription<Vec<StreamEntry>>, TransportError> {
            self.check()?;
            self.inner.consume(key, group, consumer).await
        }

        async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<(), TransportError> {
            self.check()?;
            self.inner.ack(key, group, ids).await
        }
    }

    #[async_trait]
    impl ChannelTransport for FlakyTransport {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
            self.check()?;
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(
            &self,
            patterns: &[String],
        ) -> Result<Subscription<ChannelMessage>, TransportError> {
            self.check()?;
            self.inner.subscribe(patterns).await
        }
    }

    fn flaky_bus() -> (Bus, FlakyTransport) {
        let transport = FlakyTransport::default();
        (Bus::new(Arc::new(transport.clone())), transport)
    }

    async fn append_frame(transport: &InMemoryTransport, id: &str, frame: &Frame) {
        transport
            .append(&frames_key(id), vec![(Frame::FIELD.to_string(), frame.encode().unwrap())])
            .await
            .unwrap();
    }

    fn order_mutations() -> Arc<MutationTable> {
        let mut table = MutationTable::new();
        table.insert("change-status", |state: &mut Value, payload: &Value, _: &MutationContext| {
            state["status"] = payload["status"].clone();
            Ok(())
        });
        table.insert("increment", |state: &mut Value, _: &Value, _: &MutationContext| {
            let count = state["count"].as_i64().unwrap_or(0);
            state["count"] = json!(count + 1);
            Ok(())
        });
        table.insert("fail", |_: &mut Value, _: &Value, _: &MutationContext| {
            anyhow::bail!("rejected")
        });
        Arc::new(table)
    }

    async fn writer_store(bus: &Bus, id: &str) -> Store {
        bus.create_store(id, StoreOptions::default().writer(order_mutations()))
            .await
            .unwrap()
    }

    async fn settle(store: &Store, height: Height) {
        tokio::time::timeout(WAIT, store.wait_for_height(height))
            .await
            .expect("store did not reach height")
            .unwrap();
    }

    #[tokio::test]
    async fn init_writes_the_initial_frame_at_height_zero() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;

        assert_eq!(store.init(json!({"status": "pending"})).await.unwrap(), Some(0));
        assert_eq!(store.height(), 0);
        assert_eq!(*store.state(), json!({"status": "pending"}));
        assert_eq!(transport.len("d:o1:frames"), 1);
    }

    #[tokio::test]
    async fn init_twice_is_rejected() {
        let (bus, _) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"a": 1})).await.unwrap();

        assert!(matches!(
            store.init(json!({"a": 2})).await,
            Err(StoreError::AlreadyInitialized(_))
        ));
    }

    #[tokio::test]
    async fn empty_initial_state_writes_nothing() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;

        assert_eq!(store.init(json!({})).await.unwrap(), None);
        assert_eq!(transport.len("d:o1:frames"), 0);
    }

    #[tokio::test]
    async fn mutations_advance_height_by_one() {
        let (bus, _) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"status": "pending"})).await.unwrap();

        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        settle(&store, 1).await;

        assert_eq!(store.height(), 1);
        assert_eq!(store.state()["status"], json!("active"));
    }

    #[tokio::test]
    async fn no_op_mutations_append_no_frame() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"status": "pending"})).await.unwrap();

        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        store.mutate("increment", json!(null)).await.unwrap();
        settle(&store, 2).await;

        // init + first change + increment; the repeated change wrote nothing
        assert_eq!(transport.len("d:o1:frames"), 3);
        assert_eq!(store.height(), 2);
    }

    #[tokio::test]
    async fn failing_and_unknown_mutations_are_acked_and_skipped() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"count": 0})).await.unwrap();

        store.mutate("fail", json!(null)).await.unwrap();
        store.mutate("nope", json!(null)).await.unwrap();
        store.mutate("increment", json!(null)).await.unwrap();
        settle(&store, 1).await;

        assert_eq!(store.state()["count"], json!(1));
        assert_eq!(transport.len("d:o1:frames"), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.pending("d:o1:requests", MUTATORS_GROUP), 0);
    }

    #[tokio::test]
    async fn unsupported_requests_are_acked_and_later_mutations_apply() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"count": 0})).await.unwrap();

        bus.stream(store.requests_key())
            .post("archive", &json!({"reason": "old"}))
            .await
            .unwrap();
        store.mutate("increment", json!(null)).await.unwrap();
        settle(&store, 1).await;

        assert_eq!(store.state()["count"], json!(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.pending("d:o1:requests", MUTATORS_GROUP), 0);
    }

    #[tokio::test]
    async fn transient_append_failures_retry_the_same_request() {
        let (bus, transport) = flaky_bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"count": 0})).await.unwrap();

        transport.fail_frame_appends(2);
        store.mutate("increment", json!(null)).await.unwrap();
        settle(&store, 1).await;

        assert_eq!(store.state()["count"], json!(1));
        assert_eq!(transport.inner.len("d:o1:frames"), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.inner.pending("d:o1:requests", MUTATORS_GROUP), 0);
    }

    #[tokio::test]
    async fn last_state_stays_readable_while_the_transport_is_down() {
        let (bus, transport) = flaky_bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"status": "pending"})).await.unwrap();
        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        settle(&store, 1).await;
        let status = store.query(Selector::pointer("/status"), None, QueryOptions::default());

        transport.set_down(true);
        assert!(matches!(
            store.mutate("change-status", json!({"status": "done"})).await,
            Err(StoreError::Transport(TransportError::Unavailable(_)))
        ));
        assert_eq!(store.height(), 1);
        assert_eq!(status.snapshot().unwrap(), json!("active"));

        transport.set_down(false);
        store.mutate("change-status", json!({"status": "done"})).await.unwrap();
        settle(&store, 2).await;
        assert_eq!(status.snapshot().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn frames_that_do_not_apply_are_passed_over_by_the_tail() {
        let (bus, transport) = bus();
        let writer = writer_store(&bus, "d:o1").await;
        writer.init(json!({"v": 0, "items": [1]})).await.unwrap();
        let replica = bus.create_store("d:o1", StoreOptions::default()).await.unwrap();

        let grow = Patch::replace(vec!["items".into(), "length".into()], json!(u64::MAX));
        append_frame(&transport, "d:o1", &Frame::new(1, vec![grow])).await;
        let set = Patch::replace(vec!["v".into()], json!(2));
        append_frame(&transport, "d:o1", &Frame::new(2, vec![set])).await;
        settle(&replica, 2).await;

        assert_eq!(*replica.state(), json!({"v": 2, "items": [1]}));
    }

    #[tokio::test]
    async fn concurrent_mutations_are_serialized() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"count": 0})).await.unwrap();

        let posts: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.mutate("increment", json!(null)).await })
            })
            .collect();
        for post in posts {
            post.await.unwrap().unwrap();
        }
        settle(&store, 10).await;

        assert_eq!(store.state()["count"], json!(10));
        let heights: Vec<Height> = transport_frames(&transport, "d:o1")
            .await
            .iter()
            .map(|f| f.height)
            .collect();
        assert_eq!(heights, (0..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replicas_converge_through_the_log() {
        let (bus, _) = bus();
        let writer = writer_store(&bus, "d:o1").await;
        writer.init(json!({"status": "pending"})).await.unwrap();

        let replica = bus.create_store("d:o1", StoreOptions::default()).await.unwrap();
        assert_eq!(replica.state()["status"], json!("pending"));

        replica.mutate("change-status", json!({"status": "active"})).await.unwrap();
        settle(&replica, 1).await;
        assert_eq!(replica.state()["status"], json!("active"));

        let late = bus.create_store("d:o1", StoreOptions::default()).await.unwrap();
        assert_eq!(late.height(), 1);
        assert_eq!(*late.state(), *writer.state());
    }

    #[tokio::test]
    async fn replay_skips_frames_up_to_the_starting_height() {
        let (bus, transport) = bus();
        let key = frames_key("d:o1");
        for (height, value) in [(0, "a"), (1, "b"), (2, "c")] {
            let patch = if height == 0 {
                diff(&json!({}), &json!({"v": value}))
            } else {
                diff(&json!({"v": "x"}), &json!({"v": value}))
            };
            let frame = Frame::new(height, patch);
            transport
                .append(&key, vec![(Frame::FIELD.to_string(), frame.encode().unwrap())])
                .await
                .unwrap();
        }

        let store = bus
            .create_store("d:o1", StoreOptions::default().from_height(1))
            .await
            .unwrap();

        assert_eq!(store.height(), 2);
        assert_eq!(store.state()["v"], json!("c"));
    }

    #[tokio::test]
    async fn stale_and_undecodable_entries_are_ignored() {
        let (bus, transport) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"status": "pending"})).await.unwrap();
        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        settle(&store, 1).await;

        let key = frames_key("d:o1");
        let stale = Frame::new(1, diff(&json!({}), &json!({"status": "stale"})));
        transport
            .append(&key, vec![(Frame::FIELD.to_string(), stale.encode().unwrap())])
            .await
            .unwrap();
        transport
            .append(&key, vec![(Frame::FIELD.to_string(), "garbage".to_string())])
            .await
            .unwrap();
        store.mutate("change-status", json!({"status": "done"})).await.unwrap();
        settle(&store, 2).await;

        let replica = bus.create_store("d:o1", StoreOptions::default()).await.unwrap();
        assert_eq!(replica.state()["status"], json!("done"));
        assert_eq!(store.state()["status"], json!("done"));
    }

    #[tokio::test]
    async fn transitions_carry_both_states() {
        let (bus, _) = bus();
        let store = writer_store(&bus, "d:o1").await;
        store.init(json!({"status": "pending"})).await.unwrap();
        let mut transitions = store.transitions();

        store.mutate("change-status", json!({"status": "active"})).await.unwrap();
        let transition = transitions.recv_timeout(WAIT).await.unwrap();

        assert_eq!(transition.height, 1);
        assert_eq!(transition.old["status"], json!("pending"));
        assert_eq!(transition.new["status"], json!("active"));
        assert_eq!(transition.frame.patches.len(), 1);
    }

    #[tokio::test]
    async fn disposed_stores_stop_applying() {
        let (bus, _) = bus();
        let writer = writer_store(&bus, "d:o1").await;
        writer.init(json!({"count": 0})).await.unwrap();
        let replica = bus.create_store("d:o1", StoreOptions::default()).await.unwrap();

        replica.dispose();
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.mutate("increment", json!(null)).await.unwrap();
        settle(&writer, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(replica.height(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, i64),
        Unset(String),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        let key = prop::sample::select(vec!["a", "b", "c"]).prop_map(str::to_string);
        prop_oneof![
            (key.clone(), 0i64..3).prop_map(|(k, v)| Op::Set(k, v)),
            key.prop_map(Op::Unset),
        ]
    }

    fn keyed_mutations() -> Arc<MutationTable> {
        let mut table = MutationTable::new();
        table.insert("set", |state: &mut Value, payload: &Value, _: &MutationContext| {
            if let (Some(key), Some(map)) = (payload["key"].as_str(), state.as_object_mut()) {
                map.insert(key.to_string(), payload["value"].clone());
            }
            Ok(())
        });
        table.insert("unset", |state: &mut Value, payload: &Value, _: &MutationContext| {
            if let (Some(key), Some(map)) = (payload["key"].as_str(), state.as_object_mut()) {
                map.remove(key);
            }
            Ok(())
        });
        Arc::new(table)
    }

    fn request(op: &Op) -> (&'static str, Value) {
        match op {
            Op::Set(key, value) => ("set", json!({"key": key, "value": value})),
            Op::Unset(key) => ("unset", json!({"key": key})),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn replay_reproduces_the_writer_state(ops in prop::collection::vec(arb_op(), 0..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (bus, transport) = bus();
                let mutations = keyed_mutations();
                let writer = bus
                    .create_store("d:p", StoreOptions::default().writer(mutations.clone()))
                    .await
                    .unwrap();
                writer.init(json!({"seq": 0})).await.unwrap();

                // Expected state and height, computed without the log.
                let mut expected = json!({"seq": 0});
                let mut height = 0;
                let ctx = writer.inner.context(0);
                for op in &ops {
                    let (key, payload) = request(op);
                    let mut draft = expected.clone();
                    mutations.get(key).unwrap()(&mut draft, &payload, &ctx).unwrap();
                    if draft != expected {
                        height += 1;
                        expected = draft;
                    }
                    writer.mutate(key, payload).await.unwrap();
                }
                settle(&writer, height).await;

                assert_eq!(*writer.state(), expected);
                assert_eq!(transport.len("d:p:frames") as Height, height + 1);

                let replica = bus.create_store("d:p", StoreOptions::default()).await.unwrap();
                assert_eq!(replica.height(), height);
                assert_eq!(*replica.state(), expected);
            });
        }
    }

    async fn transport_frames(transport: &InMemoryTransport, id: &str) -> Vec<Frame> {
        transport
            .range(&frames_key(id))
            .await
            .unwrap()
            .iter()
            .map(|e| Frame::decode(e.field(Frame::FIELD).unwrap()).unwrap())
            .collect()
    }
}
