//! # evlog-types: Core types for the evlog event store
//!
//! This crate contains shared types used across the evlog engine:
//! - Entity IDs ([`SequenceNumber`], [`StreamRevision`], [`PartitionId`])
//! - Optimistic-concurrency expectations ([`ExpectedRevision`])
//! - The on-log document shape ([`EventEnvelope`], [`EventMetadata`])
//! - Commit receipts ([`CommitResult`])
//! - Pluggable document serialization ([`Serializer`], [`JsonSerializer`])

use std::fmt::{self, Display};
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte or smaller values)
// ============================================================================

/// Global position of a committed document across the whole store.
///
/// Sequence numbers are 1-indexed, dense and strictly monotone: the first
/// committed document has sequence 1, the second 2, and so on, regardless of
/// which write stream received them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

/// Position of an event within a single write stream.
///
/// Revisions are 1-indexed: the first event committed to a stream has
/// revision 1. A revision of 0 denotes the empty stream and is only
/// meaningful as a version expectation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamRevision(u64);

impl StreamRevision {
    pub const EMPTY: StreamRevision = StreamRevision(0);

    pub fn new(revision: u64) -> Self {
        Self(revision)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for StreamRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for StreamRevision {
    type Output = StreamRevision;

    fn add(self, rhs: u64) -> Self::Output {
        StreamRevision(self.0 + rhs)
    }
}

impl AddAssign<u64> for StreamRevision {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for StreamRevision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<StreamRevision> for u64 {
    fn from(revision: StreamRevision) -> Self {
        revision.0
    }
}

/// 32-bit identifier of a partition, derived from its name.
///
/// The id is stored in every index entry so a reader can resolve the entry
/// back to the segment file holding the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Hashes a partition name into its stable 32-bit id.
    ///
    /// Uses the djb2-xor variant: `h = h * 33 ^ byte`, seeded with 5381.
    /// The id is stable across platforms and process restarts.
    pub fn from_name(name: &str) -> Self {
        let mut hash: u32 = 5381;
        for byte in name.bytes() {
            hash = hash.wrapping_mul(33) ^ u32::from(byte);
        }
        Self(hash)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

/// The caller's expectation of a write stream's head revision at commit time.
///
/// A concrete expectation that disagrees with the actual head fails the
/// commit, letting the caller re-read and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExpectedRevision {
    /// Skip the concurrency check entirely.
    #[default]
    Any,
    /// The stream must not contain any events yet.
    NoStream,
    /// The stream head must be exactly this revision.
    Exact(StreamRevision),
}

impl ExpectedRevision {
    /// Convenience constructor for an exact numeric expectation.
    pub fn exact(revision: u64) -> Self {
        Self::Exact(StreamRevision::new(revision))
    }
}

// ============================================================================
// Document envelope
// ============================================================================

/// Commit-scoped metadata attached to every stored document.
///
/// All events of one commit share `commit_id`, `committed_at` and
/// `commit_size`; `commit_version` is the event's 0-based offset within the
/// commit and `stream_version` its 1-based revision within the write stream.
/// Caller-supplied commit metadata is flattened into the same object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub commit_id: Uuid,
    /// Wall-clock commit time, milliseconds since the Unix epoch.
    pub committed_at: u64,
    pub commit_version: u32,
    pub commit_size: u32,
    pub stream_version: u64,
    /// Caller-supplied commit metadata, flattened alongside the fixed fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The unit of storage: an event payload wrapped with its commit metadata.
///
/// Envelopes are what the serializer turns into document bytes and what
/// matchers, streams and consumers operate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub payload: Value,
    pub metadata: EventMetadata,
}

/// Receipt returned by a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_id: Uuid,
    /// Global sequence of the first document in the commit.
    pub first_sequence: SequenceNumber,
    /// Global sequence of the last document in the commit.
    pub last_sequence: SequenceNumber,
}

// ============================================================================
// Pluggable serialization
// ============================================================================

/// Error returned by a [`Serializer`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    /// JSON encode/decode failure.
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by a custom serializer.
    #[error("serializer error: {0}")]
    Other(String),
}

/// Converts envelopes to and from document bytes.
///
/// The engine treats documents as opaque byte strings; this trait is the
/// seam where a custom wire format (or a compressing codec) plugs in.
/// [`JsonSerializer`] is the default.
pub trait Serializer: Send + Sync {
    /// Serializes an envelope into document bytes.
    fn serialize(&self, envelope: &EventEnvelope) -> Result<Vec<u8>, SerializeError>;

    /// Deserializes document bytes back into an envelope.
    fn deserialize(&self, bytes: &[u8]) -> Result<EventEnvelope, SerializeError>;
}

/// The default serializer: compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, envelope: &EventEnvelope) -> Result<Vec<u8>, SerializeError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<EventEnvelope, SerializeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
