//! Asynchronous subscriptions (delivery mechanics only).
//!
//! Every long-lived read in this workspace (stream tails, consumer groups,
//! channel subscriptions, query streams) hands its results to the caller
//! through a [`Subscription`]. The producing side holds the matching
//! [`Feed`].
//!
//! ## Disposal
//!
//! Dropping a subscription (or calling [`Subscription::dispose`]) signals the
//! feed. Producers `select!` on [`Feed::disposed`] next to their blocking
//! read, so a pending read is cancelled and its connection released instead
//! of lingering until the next message arrives.
//!
//! A message racing with disposal may still be observed once by a caller
//! that keeps polling after `dispose`; nothing is delivered after drop.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let mut subscription = transport.tail("orders:frames", TailFrom::Latest);
//!
//! while let Some(batch) = subscription.recv().await {
//!     for entry in batch {
//!         process(entry)?;
//!     }
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, watch};

/// Receiving half of a producer/consumer pair.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
    disposer: Option<watch::Sender<bool>>,
}

/// Sending half of a [`Subscription`], owned by the producing task.
#[derive(Debug)]
pub struct Feed<M> {
    sender: mpsc::UnboundedSender<M>,
    disposed: watch::Receiver<bool>,
}

/// Error returned by [`Subscription::recv_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Disconnected,
}

impl<M> Subscription<M> {
    /// Subscription fed directly through `receiver`, without a producer task
    /// to cancel.
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self {
            receiver,
            disposer: None,
        }
    }

    /// A connected feed/subscription pair.
    pub fn channel() -> (Feed<M>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (disposer, disposed) = watch::channel(false);
        (
            Feed { sender, disposed },
            Self {
                receiver,
                disposer: Some(disposer),
            },
        )
    }

    /// Wait for the next message; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout` for the next message.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(RecvTimeoutError::Disconnected),
            Err(_) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Stop the producer. Equivalent to dropping the subscription.
    pub fn dispose(self) {
        if let Some(disposer) = &self.disposer {
            let _ = disposer.send(true);
        }
    }
}

impl<M> Unpin for Subscription<M> {}

impl<M> Stream for Subscription<M> {
    type Item = M;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<M> Feed<M> {
    /// Deliver a message. Returns `false` once the subscriber is gone.
    pub fn send(&self, message: M) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || *self.disposed.borrow()
    }

    /// Resolves once the subscription has been disposed or dropped.
    ///
    /// Cancel safe.
    pub async fn disposed(&mut self) {
        loop {
            if *self.disposed.borrow() {
                return;
            }
            if self.disposed.changed().await.is_err() {
                return;
            }
        }
    }
}
