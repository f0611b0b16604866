//! Matchers and the persisted stream catalog.
//!
//! A read stream is defined by a matcher over committed envelopes. Two
//! forms exist:
//!
//! - **Field matchers** - a JSON object interpreted as "these metadata
//!   fields must equal these values". Field matchers persist in the stream
//!   catalog and survive reopen.
//! - **Predicate matchers** - an arbitrary closure. Closures cannot be
//!   persisted; the catalog records the stream without a matcher and the
//!   predicate must be re-registered after reopening.
//!
//! The catalog file (`<storage>.streams`) is fingerprinted entry-by-entry
//! with HMAC-SHA256 when a secret is configured; a reopen verifies each
//! fingerprint before re-arming the matcher, so a tampered catalog cannot
//! redirect documents into the wrong stream.

use std::fmt;
use std::sync::Arc;

use evlog_types::{EventEnvelope, PartitionId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Predicate over committed envelopes.
pub type MatchFn = Arc<dyn Fn(&EventEnvelope) -> bool + Send + Sync>;

/// Decides which committed documents belong to a read stream.
#[derive(Clone)]
pub enum Matcher {
    /// Metadata-subset equality: every listed field must be present in the
    /// envelope metadata with exactly this value.
    Fields(serde_json::Map<String, Value>),
    /// Documents stored in one partition - the implicit read stream of a
    /// write stream.
    Partition(PartitionId),
    /// An arbitrary predicate; runtime-only, not persisted.
    Predicate(MatchFn),
}

impl Matcher {
    /// Builds a field matcher from a JSON object.
    ///
    /// Returns `None` if `value` is not an object.
    pub fn fields(value: &Value) -> Option<Self> {
        value.as_object().map(|map| Self::Fields(map.clone()))
    }

    /// Tests an envelope stored in the given partition.
    pub fn matches(&self, envelope: &EventEnvelope, partition: PartitionId) -> bool {
        match self {
            Matcher::Fields(expected) => {
                let metadata = match serde_json::to_value(&envelope.metadata) {
                    Ok(Value::Object(map)) => map,
                    _ => return false,
                };
                expected
                    .iter()
                    .all(|(key, value)| metadata.get(key) == Some(value))
            }
            Matcher::Partition(id) => *id == partition,
            Matcher::Predicate(predicate) => predicate(envelope),
        }
    }

    /// Returns the persistable JSON form, if any.
    pub fn persisted(&self) -> Option<Value> {
        match self {
            Matcher::Fields(map) => Some(Value::Object(map.clone())),
            Matcher::Partition(_) | Matcher::Predicate(_) => None,
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Fields(map) => f.debug_tuple("Fields").field(map).finish(),
            Matcher::Partition(id) => f.debug_tuple("Partition").field(id).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One entry of the durable stream catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// The stream name.
    pub stream: String,
    /// Partition receiving commits, for write streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_partition: Option<String>,
    /// Persisted field matcher, for created read streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<Value>,
    /// HMAC-SHA256 fingerprint over the serialized matcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// The serialized catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

/// Computes the hex HMAC-SHA256 fingerprint of a persisted matcher.
pub fn fingerprint(secret: &str, matcher: &Value) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(matcher.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Verifies a catalog entry's fingerprint against the configured secret.
///
/// Entries without a matcher carry nothing to verify. With a secret
/// configured, a matcher entry must carry the matching fingerprint.
pub fn verify_fingerprint(secret: &str, entry: &CatalogEntry) -> bool {
    match (&entry.matcher, &entry.fingerprint) {
        (None, _) => true,
        (Some(matcher), Some(stored)) => &fingerprint(secret, matcher) == stored,
        (Some(_), None) => false,
    }
}
