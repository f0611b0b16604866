//! Fixed-record positional index.
//!
//! An [`Index`] maps a 1-based entry number to an [`IndexEntry`] describing
//! where a document lives: the owning partition, its byte position, and its
//! framed size, plus a monotone 64-bit key used for binary search.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                        │
//! ├─────────────────────────────────────────────────────────┤
//! │  0       │  11    │  Magic bytes: "evlogindex1"         │
//! │  11      │  1     │  Newline                            │
//! │  12      │  1     │  Version: 0x01                      │
//! │  13      │  1     │  Entry size: 24                     │
//! │  14      │  4     │  Metadata length (u32 LE)           │
//! │  18      │  N     │  Metadata (JSON)                    │
//! │  18+N    │  24*M  │  Fixed-size entries                 │
//! └─────────────────────────────────────────────────────────┘
//!
//! Entry: [number:u64][position:u64][size:u32][partition:u32], all LE
//! ```
//!
//! The header metadata is set at creation and immutable for the lifetime of
//! the file; reopening with different metadata fails. Random reads go
//! through a small LRU of page-sized buffers; unflushed entries live in an
//! in-memory tail consulted first.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use evlog_types::PartitionId;
use lru::LruCache;
use serde_json::Value;
use tracing::{debug, warn};

use crate::partition::FlushCallback;
use crate::StorageError;

/// Magic bytes identifying an index file.
const MAGIC: &[u8; 11] = b"evlogindex1";

/// Current index file format version.
const VERSION: u8 = 0x01;

/// Fixed size of every entry in bytes.
pub const INDEX_ENTRY_SIZE: usize = 24;

/// Header size before the variable-length metadata:
/// magic(11) + newline(1) + version(1) + entry size(1) + metadata len(4).
const FIXED_HEADER_SIZE: usize = 18;

/// Entries per cached read page. Pages are entry-aligned so no entry ever
/// straddles a page boundary.
const ENTRIES_PER_PAGE: u64 = 170;

/// Default number of cached read pages.
const DEFAULT_PAGE_CACHE_SIZE: usize = 16;

/// Tuning knobs for an index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of page-sized read buffers kept in the LRU.
    pub page_cache_size: usize,
    /// Call the OS sync after each flush.
    pub sync_on_flush: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_cache_size: DEFAULT_PAGE_CACHE_SIZE,
            sync_on_flush: false,
        }
    }
}

/// One positional index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Monotone 64-bit key, typically the global sequence number.
    pub number: u64,
    /// Byte position of the document in the partition body.
    pub position: u64,
    /// Framed on-disk size of the document (payload + 11).
    pub size: u32,
    /// Id of the owning partition.
    pub partition: u32,
}

impl IndexEntry {
    pub fn new(number: u64, position: u64, size: u32, partition: PartitionId) -> Self {
        Self {
            number,
            position,
            size,
            partition: partition.as_u32(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.number.to_le_bytes());
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.partition.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), INDEX_ENTRY_SIZE);
        Self {
            number: u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice")),
            position: u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice")),
            size: u32::from_le_bytes(bytes[16..20].try_into().expect("4-byte slice")),
            partition: u32::from_le_bytes(bytes[20..24].try_into().expect("4-byte slice")),
        }
    }
}

/// Append-only index of fixed-size entries.
///
/// # Invariants
///
/// - Entry numbers are 1-based and `length` counts every entry, flushed
///   or not.
/// - `(file size - header size) / INDEX_ENTRY_SIZE == flushed_length`.
/// - Keys are strictly increasing in entry order.
pub struct Index {
    name: String,
    path: PathBuf,
    file: File,
    config: IndexConfig,

    header_size: u64,
    metadata_bytes: Vec<u8>,

    /// Total entries, including the unflushed tail.
    length: u64,
    /// Entries durably on disk.
    flushed_length: u64,

    tail: Vec<IndexEntry>,
    flush_callbacks: Vec<FlushCallback>,

    /// Page number -> raw page bytes (entry-aligned).
    pages: LruCache<u64, Vec<u8>>,

    closed: bool,
}

impl Index {
    /// Opens (or creates) the index file at `path`.
    ///
    /// When `metadata` is given and the file already exists, the stored
    /// metadata must match byte-for-byte. Passing no metadata accepts
    /// whatever is on disk.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidHeader`] - magic bytes don't match
    /// - [`StorageError::VersionMismatch`] - unsupported format version
    /// - [`StorageError::EntrySizeMismatch`] - stored entry size differs
    /// - [`StorageError::MetadataMismatch`] - metadata argument differs from
    ///   the stored metadata
    pub fn open(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        metadata: Option<&Value>,
        config: IndexConfig,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let name = name.into();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let (metadata_bytes, header_size, length) = if file_len == 0 {
            let metadata_bytes = match metadata {
                Some(value) => serde_json::to_vec(value)?,
                None => Vec::new(),
            };
            let mut header = Vec::with_capacity(FIXED_HEADER_SIZE + metadata_bytes.len());
            header.extend_from_slice(MAGIC);
            header.push(b'\n');
            header.push(VERSION);
            header.push(INDEX_ENTRY_SIZE as u8);
            header.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
            header.extend_from_slice(&metadata_bytes);
            file.write_all(&header)?;
            file.flush()?;
            (metadata_bytes, header.len() as u64, 0)
        } else {
            if file_len < FIXED_HEADER_SIZE as u64 {
                return Err(StorageError::InvalidHeader { path });
            }
            let mut header = [0u8; FIXED_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[..11] != MAGIC || header[11] != b'\n' {
                return Err(StorageError::InvalidHeader { path });
            }
            if header[12] != VERSION {
                return Err(StorageError::VersionMismatch {
                    expected: VERSION,
                    actual: header[12],
                });
            }
            if header[13] != INDEX_ENTRY_SIZE as u8 {
                return Err(StorageError::EntrySizeMismatch {
                    expected: INDEX_ENTRY_SIZE as u8,
                    actual: header[13],
                });
            }
            let metadata_len =
                u32::from_le_bytes(header[14..18].try_into().expect("4-byte slice")) as usize;
            let mut metadata_bytes = vec![0u8; metadata_len];
            file.read_exact(&mut metadata_bytes)?;

            if let Some(value) = metadata {
                let given = serde_json::to_vec(value)?;
                if given != metadata_bytes {
                    return Err(StorageError::MetadataMismatch);
                }
            }

            let header_size = (FIXED_HEADER_SIZE + metadata_len) as u64;
            let body = file_len - header_size;
            let remainder = body % INDEX_ENTRY_SIZE as u64;
            if remainder != 0 {
                // Partial record at the tail, drop it.
                warn!(index = %name, "partial index record at tail, truncating");
                file.set_len(file_len - remainder)?;
            }
            (metadata_bytes, header_size, (body - remainder) / INDEX_ENTRY_SIZE as u64)
        };

        debug!(index = %name, length, "index opened");

        let page_cache_size =
            NonZeroUsize::new(config.page_cache_size.max(1)).expect("max(1) is nonzero");

        Ok(Self {
            name,
            path,
            file,
            config,
            header_size,
            metadata_bytes,
            length,
            flushed_length: length,
            tail: Vec::new(),
            flush_callbacks: Vec::new(),
            pages: LruCache::new(page_cache_size),
            closed: false,
        })
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of entries, including any unflushed tail.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Returns `true` if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the metadata stored in the header, if any.
    pub fn metadata(&self) -> Result<Option<Value>, StorageError> {
        if self.metadata_bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.metadata_bytes)?))
    }

    /// Appends an entry and returns its 1-based entry number.
    ///
    /// The entry lands in the in-memory tail; [`Self::flush`] makes it
    /// durable.
    pub fn add(&mut self, entry: IndexEntry) -> Result<u64, StorageError> {
        self.add_inner(entry, None)
    }

    /// Like [`Self::add`], additionally registering a callback that runs
    /// once the entry has reached the file.
    pub fn add_with<F>(&mut self, entry: IndexEntry, on_flush: F) -> Result<u64, StorageError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_inner(entry, Some(Box::new(on_flush)))
    }

    fn add_inner(
        &mut self,
        entry: IndexEntry,
        on_flush: Option<FlushCallback>,
    ) -> Result<u64, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        // Precondition: keys are strictly increasing in entry order.
        debug_assert!(
            self.tail.last().is_none_or(|last| entry.number > last.number),
            "entry key {} must be greater than tail key {:?}",
            entry.number,
            self.tail.last().map(|e| e.number)
        );

        self.tail.push(entry);
        self.length += 1;
        if let Some(cb) = on_flush {
            self.flush_callbacks.push(cb);
        }
        Ok(self.length)
    }

    /// Returns the entry at 1-based number `n`.
    ///
    /// Out-of-bounds numbers (including 0) and a closed index yield `None`.
    pub fn get(&mut self, n: u64) -> Result<Option<IndexEntry>, StorageError> {
        if self.closed || n == 0 || n > self.length {
            return Ok(None);
        }
        if n > self.flushed_length {
            let offset = (n - self.flushed_length - 1) as usize;
            return Ok(Some(self.tail[offset]));
        }

        let page_no = (n - 1) / ENTRIES_PER_PAGE;
        let offset = ((n - 1) % ENTRIES_PER_PAGE) as usize * INDEX_ENTRY_SIZE;
        let page = self.page(page_no)?;
        Ok(Some(IndexEntry::decode(&page[offset..offset + INDEX_ENTRY_SIZE])))
    }

    /// Loads (or returns the cached) read page holding flushed entries.
    fn page(&mut self, page_no: u64) -> Result<&Vec<u8>, StorageError> {
        if !self.pages.contains(&page_no) {
            let first_entry = page_no * ENTRIES_PER_PAGE;
            let entries = ENTRIES_PER_PAGE.min(self.flushed_length - first_entry);
            let mut buf = vec![0u8; (entries as usize) * INDEX_ENTRY_SIZE];
            let byte_offset = self.header_size + first_entry * INDEX_ENTRY_SIZE as u64;
            self.file.seek(SeekFrom::Start(byte_offset))?;
            self.file.read_exact(&mut buf)?;
            self.pages.put(page_no, buf);
        }
        Ok(self.pages.get(&page_no).expect("page cached above"))
    }

    /// Returns the inclusive range of entries `[from, to]`.
    ///
    /// Negative bounds count from the end: `from = -1` is the last entry
    /// (`length + from + 1`), `to = -k` resolves to `length - k`. An omitted
    /// `to` means `length`. After normalisation the range is invalid - and
    /// `None` is returned - iff `from < 1`, `to > length`, or `from > to`.
    pub fn range(
        &mut self,
        from: i64,
        to: Option<i64>,
    ) -> Result<Option<Vec<IndexEntry>>, StorageError> {
        if self.closed {
            return Ok(None);
        }
        let length = self.length as i64;
        let from = if from < 0 { length + from + 1 } else { from };
        let to = match to {
            None => length,
            Some(t) if t < 0 => length + t,
            Some(t) => t,
        };
        if from < 1 || to > length || from > to {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity((to - from + 1) as usize);
        for n in from..=to {
            let entry = self.get(n as u64)?.expect("entry within bounds");
            entries.push(entry);
        }
        Ok(Some(entries))
    }

    /// Returns every entry, in order. Shorthand for `range(1, length)`.
    pub fn all(&mut self) -> Result<Option<Vec<IndexEntry>>, StorageError> {
        if self.is_empty() {
            return Ok(Some(Vec::new()));
        }
        self.range(1, None)
    }

    /// Binary-searches the monotone keys.
    ///
    /// Returns 0 when `key` precedes the first entry (or the index is
    /// empty), `length` when `key >= last key`, otherwise the largest `n`
    /// with `entries[n].number <= key`.
    pub fn find(&mut self, key: u64) -> Result<u64, StorageError> {
        if self.closed || self.length == 0 {
            return Ok(0);
        }
        let first = self.get(1)?.expect("entry within bounds");
        if key < first.number {
            return Ok(0);
        }
        let last = self.get(self.length)?.expect("entry within bounds");
        if key >= last.number {
            return Ok(self.length);
        }

        // Invariant: entries[lo].number <= key < entries[hi].number
        let mut lo = 1;
        let mut hi = self.length;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let entry = self.get(mid)?.expect("entry within bounds");
            if entry.number <= key {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Truncates the index after entry `after_n`.
    ///
    /// Pending adds are flushed first. A no-op when `after_n >= length`.
    pub fn truncate(&mut self, after_n: u64) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if after_n >= self.length {
            return Ok(());
        }
        self.flush()?;
        self.file
            .set_len(self.header_size + after_n * INDEX_ENTRY_SIZE as u64)?;
        debug!(index = %self.name, prev = self.length, new = after_n, "index truncated");
        self.length = after_n;
        self.flushed_length = after_n;
        self.pages.clear();
        Ok(())
    }

    /// Writes the in-memory tail to disk in a single I/O and runs registered
    /// flush callbacks in registration order.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if !self.tail.is_empty() {
            let mut buf = Vec::with_capacity(self.tail.len() * INDEX_ENTRY_SIZE);
            for entry in &self.tail {
                entry.encode(&mut buf);
            }
            let byte_offset = self.header_size + self.flushed_length * INDEX_ENTRY_SIZE as u64;
            self.file.seek(SeekFrom::Start(byte_offset))?;
            self.file.write_all(&buf)?;
            if self.config.sync_on_flush {
                self.file.sync_all()?;
            }

            // Drop cached pages the new entries landed on.
            let first_page = self.flushed_length / ENTRIES_PER_PAGE;
            let last_page = (self.length - 1) / ENTRIES_PER_PAGE;
            for page_no in first_page..=last_page {
                self.pages.pop(&page_no);
            }

            self.flushed_length = self.length;
            self.tail.clear();
        }
        for callback in self.flush_callbacks.drain(..) {
            callback();
        }
        Ok(())
    }

    /// Reloads the length from the file size.
    ///
    /// Read-only instances call this when the directory watcher reports a
    /// change; there must be no pending adds.
    pub fn refresh(&mut self) -> Result<(), StorageError> {
        debug_assert!(self.tail.is_empty(), "refresh with pending adds");
        let file_len = self.file.metadata()?.len();
        let body = file_len.saturating_sub(self.header_size);
        self.length = body / INDEX_ENTRY_SIZE as u64;
        self.flushed_length = self.length;
        self.pages.clear();
        Ok(())
    }

    /// Flushes and closes the index; further adds fail and lookups return
    /// `None`.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        self.pages.clear();
        debug!(index = %self.name, "index closed");
        Ok(())
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("flushed_length", &self.flushed_length)
            .field("cached_pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}
