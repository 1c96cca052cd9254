//! Writer loop: turns mutation requests into frames, one at a time.

use std::sync::Arc;
use std::time::Duration;

use rfx_core::{Frame, Height, diff};
use rfx_events::{StreamEntry, StreamTransport, Subscription};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::request::Request;
use crate::store::{MUTATORS_GROUP, MutationTable, StoreInner};

/// First delay before retrying a request whose frame could not be appended.
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

pub(crate) async fn run(
    inner: Arc<StoreInner>,
    mutations: Arc<MutationTable>,
    mut requests: Subscription<Vec<StreamEntry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    'serve: loop {
        let batch = tokio::select! {
            batch = requests.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        for entry in batch {
            // A transient append failure retries the same request until it
            // lands; the request is acked only after that.
            let mut delay = RETRY_BASE;
            loop {
                match handle(&inner, &mutations, &entry).await {
                    Ok(_) => break,
                    Err(StoreError::Transport(e)) if e.is_transient() => {
                        warn!(
                            store_id = %inner.id,
                            entry_id = %entry.id(),
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "failed to append frame; retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => break 'serve,
                        }
                        delay = (delay * 2).min(RETRY_MAX);
                    }
                    Err(e) => {
                        warn!(store_id = %inner.id, entry_id = %entry.id(), error = %e, "request rejected");
                        break;
                    }
                }
            }

            if let Err(e) = inner
                .bus()
                .transport()
                .ack(inner.requests_key(), MUTATORS_GROUP, &[entry.id().clone()])
                .await
            {
                error!(store_id = %inner.id, entry_id = %entry.id(), error = %e, "failed to ack request");
            }
        }
    }

    debug!(store_id = %inner.id, "writer loop stopped");
}

async fn handle(
    inner: &StoreInner,
    mutations: &MutationTable,
    entry: &StreamEntry,
) -> StoreResult<Option<Height>> {
    match Request::decode(entry)? {
        Request::Mutate(args) => apply_mutation(inner, mutations, &args.key, &args.payload).await,
    }
}

/// Run one mutator against the current state and persist the difference.
///
/// Returns the height of the written frame, or `None` for a no-op.
#[instrument(skip(inner, mutations, payload), fields(store_id = %inner.id), err)]
async fn apply_mutation(
    inner: &StoreInner,
    mutations: &MutationTable,
    key: &str,
    payload: &Value,
) -> StoreResult<Option<Height>> {
    let mutator = mutations
        .get(key)
        .ok_or_else(|| StoreError::unknown_mutation(key))?;

    let _guard = inner.apply_lock.lock().await;
    let snapshot = inner.snapshot();
    let height = snapshot.height.map_or(0, |h| h + 1);

    let mut draft = (*snapshot.state).clone();
    let ctx = inner.context(snapshot.height.unwrap_or(0));
    mutator(&mut draft, payload, &ctx).map_err(|source| StoreError::Mutation {
        key: key.to_string(),
        source,
    })?;

    let patches = diff(&snapshot.state, &draft);
    if patches.is_empty() {
        debug!(store_id = %inner.id, key, "mutation changed nothing; no frame written");
        return Ok(None);
    }

    let frame = Frame::new(height, patches);
    inner.append_frame(&frame).await?;
    inner.apply_frame(frame);
    Ok(Some(height))
}
