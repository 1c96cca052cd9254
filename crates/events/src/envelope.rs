use core::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Field/value pairs of a stream entry, in append order.
pub type Fields = Vec<(String, String)>;

/// Position of an entry in a stream (`<ms>-<seq>`).
///
/// Ordering follows the numeric parts, so `"10-0" > "9-5"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Position before any entry.
    pub fn origin() -> Self {
        Self("0-0".to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Option<(u64, u64)> {
        let (ms, seq) = self.0.split_once('-').unwrap_or((self.0.as_str(), "0"));
        Some((ms.parse().ok()?, seq.parse().ok()?))
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    id: EntryId,
    fields: Fields,
}

impl StreamEntry {
    pub fn new(id: EntryId, fields: Fields) -> Self {
        Self { id, fields }
    }

    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// First value stored under `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A message delivered through a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Subscription pattern that matched, if any.
    pub pattern: Option<String>,
    pub payload: String,
}
