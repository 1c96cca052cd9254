//! Tail loop: applies frames appended by the writer (or anyone else) after
//! replay.

use std::sync::Arc;

use rfx_core::Frame;
use rfx_events::{StreamEntry, Subscription};
use tokio::sync::watch;
use tracing::debug;

use crate::store::StoreInner;

pub(crate) async fn run(
    inner: Arc<StoreInner>,
    mut tail: Subscription<Vec<StreamEntry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let batch = tokio::select! {
            batch = tail.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let mut frames: Vec<Frame> = batch
            .iter()
            .filter_map(|entry| inner.decode_frame(entry))
            .collect();

        let _guard = inner.apply_lock.lock().await;
        frames.retain(|frame| inner.is_applicable(frame.height));
        frames.sort_by_key(|frame| frame.height);
        for frame in frames {
            inner.apply_frame(frame);
        }
    }

    debug!(store_id = %inner.id, "tail loop stopped");
}
