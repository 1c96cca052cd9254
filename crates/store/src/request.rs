//! Request entries posted to a store's request stream.
//!
//! Wire shape: field `type` holds the request kind, field `args` its JSON
//! arguments. Only `mutate` is understood; the type field leaves room for
//! other kinds, which the writer rejects as unsupported.

use rfx_events::{Fields, StreamEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

pub const TYPE_FIELD: &str = "type";
pub const ARGS_FIELD: &str = "args";
pub const MUTATE: &str = "mutate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationArgs {
    pub key: String,
    #[serde(default)]
    pub payload: Value,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Mutate(MutationArgs),
}

impl Request {
    pub fn mutate(key: impl Into<String>, payload: Value) -> Self {
        Self::Mutate(MutationArgs {
            key: key.into(),
            payload,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mutate(_) => MUTATE,
        }
    }

    pub fn encode(&self) -> StoreResult<Fields> {
        let args = match self {
            Self::Mutate(args) => serde_json::to_value(args)?,
        };
        Ok(encode_fields(self.kind(), &args))
    }

    pub fn decode(entry: &StreamEntry) -> StoreResult<Self> {
        let entry_id = entry.id().as_str();
        let kind = entry
            .field(TYPE_FIELD)
            .ok_or_else(|| StoreError::malformed(entry_id, "missing type field"))?;
        if kind != MUTATE {
            return Err(StoreError::UnsupportedRequest(kind.to_string()));
        }

        let raw = entry
            .field(ARGS_FIELD)
            .ok_or_else(|| StoreError::malformed(entry_id, "missing args field"))?;
        let args = serde_json::from_str(raw)
            .map_err(|e| StoreError::malformed(entry_id, e.to_string()))?;
        Ok(Self::Mutate(args))
    }
}

pub(crate) fn encode_fields(kind: &str, args: &Value) -> Fields {
    vec![
        (TYPE_FIELD.to_string(), kind.to_string()),
        (ARGS_FIELD.to_string(), args.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use rfx_events::EntryId;
    use serde_json::json;

    use super::*;

    fn entry(fields: Fields) -> StreamEntry {
        StreamEntry::new(EntryId::new("1-0"), fields)
    }

    #[test]
    fn mutate_requests_decode_from_their_fields() {
        let request = Request::mutate("change-status", json!({"status": "active"}));
        let decoded = Request::decode(&entry(request.encode().unwrap())).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn other_request_types_are_unsupported() {
        let fields = encode_fields("compact", &json!({}));
        let err = Request::decode(&entry(fields)).unwrap_err();

        assert!(matches!(err, StoreError::UnsupportedRequest(kind) if kind == "compact"));
    }

    #[test]
    fn missing_args_are_malformed() {
        let fields = vec![(TYPE_FIELD.to_string(), MUTATE.to_string())];
        let err = Request::decode(&entry(fields)).unwrap_err();

        assert!(matches!(err, StoreError::MalformedRequest { .. }));
    }
}
