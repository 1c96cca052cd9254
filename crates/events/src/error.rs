use thiserror::Error;

/// Transport-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure (connect refused, connection dropped).
    ///
    /// Long-running loops retry with backoff instead of giving up.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A consumer group with this name already exists on the stream.
    ///
    /// Expected when several processes race to create the same group; see
    /// [`ensure_group`](crate::transport::ensure_group).
    #[error("consumer group {group} already exists on {key}")]
    GroupAlreadyExists { key: String, group: String },

    /// The backend rejected a command.
    #[error("transport command failed: {0}")]
    Command(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The transport (or the subscription) was shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
