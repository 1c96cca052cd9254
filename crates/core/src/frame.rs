//! Frames: the unit of the append-only instance log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::patch::Patch;

/// Position of a frame in an instance's history.
///
/// Height 0 is the initial state frame; every later frame is written at
/// `height + 1` of the state it was computed from.
pub type Height = u64;

/// An ordered set of patches at a given height.
///
/// Frames are immutable once appended; replaying every frame of a log in
/// ascending height order deterministically reproduces the instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub height: Height,
    pub patches: Vec<Patch>,
    /// Written as RFC 3339; epoch milliseconds are accepted on read.
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub ts: DateTime<Utc>,
}

mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Rfc3339(DateTime<Utc>),
        Millis(i64),
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Rfc3339(ts) => Ok(ts),
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {ms}"))),
        }
    }
}

impl Frame {
    pub fn new(height: Height, patches: Vec<Patch>) -> Self {
        Self {
            height,
            patches,
            ts: Utc::now(),
        }
    }

    /// Log entry field holding the encoded frame.
    pub const FIELD: &'static str = "frame";

    pub fn encode(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
