//! Strongly-typed identifiers used across domains and instances.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a domain: hex digest of `system:name` followed by the revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(String);

/// Identifier of an instance, unique within its domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

/// `domain_id:instance_id`, the globally unique name of an instance.
///
/// Every log key and channel name of an instance is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullInstanceId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(CoreError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_newtype!(DomainId, "DomainId");
impl_string_newtype!(InstanceId, "InstanceId");
impl_string_newtype!(FullInstanceId, "FullInstanceId");

impl DomainId {
    /// Derive the domain id from its qualified name and revision.
    ///
    /// Two domains with the same system, name and revision share their logs.
    pub fn derive(system: &str, name: &str, revision: u32) -> Self {
        Self(sha256_hex(format!("{system}:{name}{revision}").as_bytes()))
    }
}

impl FullInstanceId {
    pub fn new(domain: &DomainId, instance: &InstanceId) -> Self {
        Self(format!("{domain}:{instance}"))
    }

    /// The instance part (everything after the last `:`).
    pub fn instance_part(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }
}

/// `prefix` followed by a 64 character hex digest of a fresh UUIDv7.
///
/// Stable length, collision resistant, and free of `:` so it can be embedded
/// in colon-joined keys.
pub fn unique_id(prefix: &str) -> String {
    format!("{prefix}{}", sha256_hex(Uuid::now_v7().as_bytes()))
}

fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_id_is_stable_per_name_and_revision() {
        let a = DomainId::derive("rfx1", "orders", 1);
        let b = DomainId::derive("rfx1", "orders", 1);
        let c = DomainId::derive("rfx1", "orders", 2);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unique_ids_keep_prefix_and_length() {
        let a = unique_id("order-");
        let b = unique_id("order-");

        assert_ne!(a, b);
        assert!(a.starts_with("order-"));
        assert_eq!(a.len(), "order-".len() + 64);
    }

    #[test]
    fn full_instance_id_joins_with_colon() {
        let domain = DomainId::derive("rfx1", "orders", 1);
        let instance: InstanceId = "abc".parse().unwrap();
        let full = FullInstanceId::new(&domain, &instance);

        assert_eq!(full.as_str(), format!("{domain}:abc"));
        assert_eq!(full.instance_part(), "abc");
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(matches!(
            "  ".parse::<InstanceId>(),
            Err(CoreError::InvalidId(_))
        ));
    }
}
