//! Error types for store operations.

use std::io;
use std::path::PathBuf;

use evlog_storage::StorageError;
use evlog_types::SerializeError;

/// Errors that can occur at the event-store level.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Byte-level storage failure (segment or index).
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    /// Document or catalog serialization failure.
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    /// Catalog or checkpoint JSON failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream head moved past the caller's expected revision.
    #[error("optimistic concurrency failure on stream {stream}: expected revision {expected}, actual {actual}")]
    OptimisticConcurrency {
        stream: String,
        expected: u64,
        actual: u64,
    },

    /// A stream with this name already exists.
    #[error("stream already exists: {0}")]
    StreamExists(String),

    /// No stream with this name is known to the store.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// Another writer holds the directory lock.
    #[error("storage lock is held by another writer: {path}")]
    LockHeld { path: PathBuf },

    /// Write operation on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// Operation on a closed store.
    #[error("store is closed")]
    Closed,

    /// Bad argument at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A persisted matcher failed its HMAC fingerprint check.
    #[error("matcher fingerprint mismatch for stream {stream}")]
    FingerprintMismatch { stream: String },

    /// Directory watcher failure.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}
