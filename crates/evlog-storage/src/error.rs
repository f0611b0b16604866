//! Error types for segment and index operations.

use std::io;
use std::path::PathBuf;

/// Errors that can occur in the storage layer.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    /// File does not start with the expected magic bytes.
    #[error("invalid file header: {path}")]
    InvalidHeader { path: PathBuf },

    /// File carries the right magic but an unsupported format version.
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// A document frame is malformed or extends past the end of the file.
    #[error("corrupt file: invalid document at position {position}")]
    CorruptFile { position: u64 },

    /// The caller's expected document size disagrees with the stored frame.
    #[error("invalid data size: expected {expected}, found {actual}")]
    InvalidDataSize { expected: u64, actual: u64 },

    /// Index reopened with metadata that differs from what is on disk.
    #[error("index metadata mismatch")]
    MetadataMismatch,

    /// Index reopened with a different fixed entry size.
    #[error("index entry size mismatch: expected {expected}, found {actual}")]
    EntrySizeMismatch { expected: u8, actual: u8 },

    /// Document is too large for the 10-digit length prefix.
    #[error("document too large: {size} bytes")]
    DocumentTooLarge { size: usize },

    /// Write operation on a closed partition or index.
    #[error("storage is closed")]
    Closed,

    /// Index header metadata failed to encode or decode.
    #[error("metadata serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
