//! Append-only segment file with length-prefixed documents.
//!
//! A [`Partition`] holds the documents of one write stream as a contiguous
//! sequence of frames behind a small magic header.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  header   │  MAGIC (8 bytes ASCII) '\n'                  │
//! ├──────────────────────────────────────────────────────────┤
//! │  document │  LEN (10 ASCII digits, right-space-padded)   │
//! │           │  PAYLOAD (LEN bytes)                         │
//! │           │  '\n'                                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  document │  ...                                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Positions are byte offsets into the body (header excluded) and are stable
//! for the lifetime of the file: documents are never moved or rewritten, only
//! a whole suffix may be truncated. The trailing newline is not parsed on the
//! read path; it aids human inspection and the recovery scan.
//!
//! # Buffering
//!
//! Writes land in an in-memory write buffer and are drained in a single I/O
//! by [`Partition::flush`]. A document larger than the buffer bypasses it
//! entirely. Reads are served from the unflushed buffer window when the
//! position falls inside it, otherwise through a read buffer refilled on
//! miss.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use evlog_types::PartitionId;
use tracing::{debug, warn};

use crate::StorageError;

/// Magic bytes identifying a partition file; the trailing digit is the
/// format version.
const MAGIC: &[u8; 8] = b"evlprt01";

/// Length of the version-independent magic prefix.
const MAGIC_PREFIX_LEN: usize = 7;

/// Header size: magic(8) + newline(1).
pub const HEADER_SIZE: u64 = 9;

/// Size of the ASCII length prefix on every document.
pub const LEN_PREFIX_SIZE: usize = 10;

/// Bytes a document occupies on disk beyond its payload: length prefix
/// plus trailing newline.
pub const FRAME_OVERHEAD: u64 = LEN_PREFIX_SIZE as u64 + 1;

/// Default read buffer: one page plus room for a length prefix.
const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024 + LEN_PREFIX_SIZE;

/// Default write buffer size.
const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Callback invoked once the registering write has reached the file.
pub type FlushCallback = Box<dyn FnOnce() + Send>;

/// Tuning knobs for a partition.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Read buffer capacity in bytes.
    pub read_buffer_size: usize,
    /// Write buffer capacity in bytes.
    pub write_buffer_size: usize,
    /// Flush once this many documents are buffered (0 = size-based only).
    pub max_write_buffer_documents: usize,
    /// Call the OS sync after each flush.
    pub sync_on_flush: bool,
    /// Serve reads from the unflushed write buffer window.
    pub dirty_reads: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_write_buffer_documents: 0,
            sync_on_flush: false,
            dirty_reads: true,
        }
    }
}

/// One append-only segment file.
///
/// # Invariants
///
/// - A document appended at position `P` with payload size `S` occupies
///   bytes `P .. P + S + 11` of the body forever; only whole-suffix
///   truncation shrinks the file.
/// - `size` equals the on-disk body length once the write buffer is
///   drained; buffered bytes are already accounted to callers as their
///   returned positions.
/// - `flushed_size` is always a frame boundary.
pub struct Partition {
    name: String,
    id: PartitionId,
    path: PathBuf,
    file: File,
    config: PartitionConfig,

    /// Logical body size in bytes, including unflushed writes.
    size: u64,
    /// Body bytes actually on disk.
    flushed_size: u64,

    write_buf: Vec<u8>,
    buffered_documents: usize,
    flush_callbacks: Vec<FlushCallback>,

    read_buf: Vec<u8>,
    /// Body offset of `read_buf[0]`; only the first `read_buf_len` bytes
    /// are valid.
    read_buf_pos: u64,
    read_buf_len: usize,

    closed: bool,
}

impl Partition {
    /// Opens (or creates) the partition file at `path`.
    ///
    /// An empty file receives the header; an existing file must start with
    /// the expected magic.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidHeader`] - magic prefix does not match
    /// - [`StorageError::VersionMismatch`] - magic matches but the format
    ///   version differs
    pub fn open(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        config: PartitionConfig,
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
        let flushed_size = if file_len == 0 {
            file.write_all(MAGIC)?;
            file.write_all(b"\n")?;
            file.flush()?;
            0
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            if file_len < HEADER_SIZE {
                return Err(StorageError::InvalidHeader { path });
            }
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if header[..MAGIC_PREFIX_LEN] != MAGIC[..MAGIC_PREFIX_LEN]
                || header[HEADER_SIZE as usize - 1] != b'\n'
            {
                return Err(StorageError::InvalidHeader { path });
            }
            if header[MAGIC_PREFIX_LEN] != MAGIC[MAGIC_PREFIX_LEN] {
                return Err(StorageError::VersionMismatch {
                    expected: MAGIC[MAGIC_PREFIX_LEN],
                    actual: header[MAGIC_PREFIX_LEN],
                });
            }
            file_len - HEADER_SIZE
        };

        debug!(partition = %name, size = flushed_size, "partition opened");

        let read_buf = vec![0u8; config.read_buffer_size];
        let write_buf = Vec::with_capacity(config.write_buffer_size);

        Ok(Self {
            id: PartitionId::from_name(&name),
            name,
            path,
            file,
            config,
            size: flushed_size,
            flushed_size,
            write_buf,
            buffered_documents: 0,
            flush_callbacks: Vec::new(),
            read_buf,
            read_buf_pos: 0,
            read_buf_len: 0,
            closed: false,
        })
    }

    /// Returns the partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the 32-bit id derived from the partition name.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Returns the logical body size, including unflushed writes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the body bytes durably on disk.
    pub fn flushed_size(&self) -> u64 {
        self.flushed_size
    }

    /// Appends a document and returns its stable byte position.
    ///
    /// The document is framed as `LEN10 · payload · '\n'` and lands in the
    /// write buffer; a document larger than the buffer is written through
    /// directly. The returned position is valid immediately, before any
    /// flush.
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty. Empty documents are a caller bug.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, StorageError> {
        self.write_inner(data, None)
    }

    /// Like [`Self::write`], additionally registering a callback that runs
    /// once the document has reached the file. Callbacks run in
    /// registration order.
    pub fn write_with<F>(&mut self, data: &[u8], on_flush: F) -> Result<u64, StorageError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.write_inner(data, Some(Box::new(on_flush)))
    }

    fn write_inner(
        &mut self,
        data: &[u8],
        on_flush: Option<FlushCallback>,
    ) -> Result<u64, StorageError> {
        assert!(!data.is_empty(), "cannot append an empty document");
        if self.closed {
            return Err(StorageError::Closed);
        }
        if data.len() as u64 >= 10_000_000_000u64 {
            return Err(StorageError::DocumentTooLarge { size: data.len() });
        }

        let framed_len = data.len() as u64 + FRAME_OVERHEAD;
        let position = self.size;

        if framed_len > self.config.write_buffer_size as u64 {
            // Oversized document: drain the buffer, then write through.
            self.flush()?;
            let mut frame = Vec::with_capacity(framed_len as usize);
            encode_frame(data, &mut frame);
            if let Err(e) = self.write_through(&frame) {
                // A failed write leaves the tail in an unknown state; refuse
                // further writes until reopened.
                self.closed = true;
                return Err(e);
            }
            self.flushed_size += framed_len;
            self.size += framed_len;
            if let Some(cb) = on_flush {
                cb();
            }
            return Ok(position);
        }

        if self.write_buf.len() as u64 + framed_len > self.config.write_buffer_size as u64 {
            self.flush()?;
        }

        encode_frame(data, &mut self.write_buf);
        self.size += framed_len;
        self.buffered_documents += 1;
        if let Some(cb) = on_flush {
            self.flush_callbacks.push(cb);
        }

        if self.config.max_write_buffer_documents > 0
            && self.buffered_documents >= self.config.max_write_buffer_documents
        {
            self.flush()?;
        }

        Ok(position)
    }

    /// Reads the document at `position`.
    ///
    /// Returns `Ok(None)` at end-of-data: when no 10-byte length prefix fits
    /// before the logical size (`position + 10 >= size`), or when the
    /// partition is closed. With `dirty_reads` disabled, only flushed bytes
    /// are visible.
    ///
    /// `expected_size`, when given, is the framed on-disk size of the
    /// document (payload + 11) as recorded in an index entry.
    ///
    /// # Errors
    ///
    /// - [`StorageError::CorruptFile`] - malformed length prefix, or the
    ///   frame extends past the end of the data (torn write)
    /// - [`StorageError::InvalidDataSize`] - `expected_size` disagrees with
    ///   the stored frame
    pub fn read_from(
        &mut self,
        position: u64,
        expected_size: Option<u64>,
    ) -> Result<Option<Bytes>, StorageError> {
        if self.closed {
            return Ok(None);
        }
        let visible = if self.config.dirty_reads {
            self.size
        } else {
            self.flushed_size
        };
        if position + LEN_PREFIX_SIZE as u64 >= visible {
            return Ok(None);
        }

        // Unflushed window: the write buffer holds whole frames from
        // flushed_size onwards.
        if position >= self.flushed_size {
            let offset = (position - self.flushed_size) as usize;
            let length = parse_len_prefix(&self.write_buf[offset..offset + LEN_PREFIX_SIZE])
                .ok_or(StorageError::CorruptFile { position })?;
            check_frame(position, length, expected_size, self.size)?;
            let start = offset + LEN_PREFIX_SIZE;
            return Ok(Some(Bytes::copy_from_slice(
                &self.write_buf[start..start + length as usize],
            )));
        }

        if !self.read_buf_covers(position, LEN_PREFIX_SIZE) {
            self.fill_read_buffer(position)?;
        }
        let offset = (position - self.read_buf_pos) as usize;
        let length =
            parse_len_prefix(&self.read_buf[offset..offset + LEN_PREFIX_SIZE])
                .ok_or(StorageError::CorruptFile { position })?;
        check_frame(position, length, expected_size, self.size)?;

        let frame_len = length as u64 + FRAME_OVERHEAD;
        if frame_len > self.config.read_buffer_size as u64 {
            // One-shot read for a document larger than the read buffer.
            let mut payload = vec![0u8; length as usize];
            self.file
                .seek(SeekFrom::Start(HEADER_SIZE + position + LEN_PREFIX_SIZE as u64))?;
            self.file.read_exact(&mut payload)?;
            return Ok(Some(Bytes::from(payload)));
        }

        // Refill when the payload crosses the buffered window.
        if !self.read_buf_covers(position, LEN_PREFIX_SIZE + length as usize) {
            self.fill_read_buffer(position)?;
        }
        let offset = (position - self.read_buf_pos) as usize;
        let start = offset + LEN_PREFIX_SIZE;
        Ok(Some(Bytes::copy_from_slice(
            &self.read_buf[start..start + length as usize],
        )))
    }

    /// Iterates over every document in order, starting at position 0.
    pub fn read_all(&mut self) -> ReadAll<'_> {
        ReadAll {
            partition: self,
            position: 0,
        }
    }

    fn read_buf_covers(&self, position: u64, len: usize) -> bool {
        position >= self.read_buf_pos
            && position + len as u64 <= self.read_buf_pos + self.read_buf_len as u64
    }

    /// Refills the read buffer starting at `position` with as many flushed
    /// bytes as fit.
    fn fill_read_buffer(&mut self, position: u64) -> Result<(), StorageError> {
        let available = self.flushed_size.saturating_sub(position);
        let len = available.min(self.config.read_buffer_size as u64) as usize;
        self.file.seek(SeekFrom::Start(HEADER_SIZE + position))?;
        self.file.read_exact(&mut self.read_buf[..len])?;
        self.read_buf_pos = position;
        self.read_buf_len = len;
        Ok(())
    }

    /// Truncates the body after byte offset `after`.
    ///
    /// Pending writes are flushed first. A no-op when `after >= size`.
    pub fn truncate(&mut self, after: u64) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if after >= self.size {
            return Ok(());
        }
        self.flush()?;
        self.file.set_len(HEADER_SIZE + after)?;
        debug!(partition = %self.name, prev = self.size, new = after, "partition truncated");
        self.size = after;
        self.flushed_size = after;
        self.read_buf_len = 0;
        Ok(())
    }

    /// Drains the write buffer in a single I/O and runs registered flush
    /// callbacks in registration order.
    ///
    /// A failed write leaves the tail in an unknown state; the partition
    /// then refuses further writes until reopened.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if !self.write_buf.is_empty() {
            let buf = std::mem::take(&mut self.write_buf);
            if let Err(e) = self.write_through(&buf) {
                self.closed = true;
                return Err(e);
            }
            self.flushed_size += buf.len() as u64;
            self.write_buf = buf;
            self.write_buf.clear();
            self.buffered_documents = 0;
        }
        for callback in self.flush_callbacks.drain(..) {
            callback();
        }
        Ok(())
    }

    /// Writes `bytes` at the flushed tail, syncing when configured.
    fn write_through(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + self.flushed_size))?;
        self.file.write_all(bytes)?;
        if self.config.sync_on_flush {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Validates every frame from the start of the body and truncates the
    /// torn suffix, if any.
    ///
    /// Returns the recovered body size: the end of the last complete
    /// document.
    pub fn recover(&mut self) -> Result<u64, StorageError> {
        let mut position = 0;
        let valid_end = loop {
            match self.read_from(position, None) {
                Ok(Some(doc)) => position += doc.len() as u64 + FRAME_OVERHEAD,
                Ok(None) => break position,
                Err(StorageError::CorruptFile { .. }) => break position,
                Err(e) => return Err(e),
            }
        };
        if valid_end < self.size {
            warn!(
                partition = %self.name,
                size = self.size,
                recovered = valid_end,
                "torn write detected, truncating partition tail"
            );
            self.truncate(valid_end)?;
        }
        Ok(valid_end)
    }

    /// Reloads the size from disk.
    ///
    /// Read-only instances call this when the directory watcher reports a
    /// change; there must be no pending writes.
    pub fn refresh(&mut self) -> Result<(), StorageError> {
        debug_assert!(self.write_buf.is_empty(), "refresh with pending writes");
        let file_len = self.file.metadata()?.len();
        self.flushed_size = file_len.saturating_sub(HEADER_SIZE);
        self.size = self.flushed_size;
        self.read_buf_len = 0;
        Ok(())
    }

    /// Flushes and closes the partition; further writes fail and reads
    /// return `None`.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        self.write_buf = Vec::new();
        self.read_buf = Vec::new();
        self.read_buf_len = 0;
        debug!(partition = %self.name, "partition closed");
        Ok(())
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flushed_size", &self.flushed_size)
            .field("buffered_documents", &self.buffered_documents)
            .finish_non_exhaustive()
    }
}

/// Lazy sequence of documents produced by [`Partition::read_all`].
pub struct ReadAll<'a> {
    partition: &'a mut Partition,
    position: u64,
}

impl Iterator for ReadAll<'_> {
    type Item = Result<Bytes, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.partition.read_from(self.position, None) {
            Ok(Some(doc)) => {
                self.position += doc.len() as u64 + FRAME_OVERHEAD;
                Some(Ok(doc))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Appends `LEN10 · payload · '\n'` to `buf`.
fn encode_frame(data: &[u8], buf: &mut Vec<u8>) {
    let mut prefix = [b' '; LEN_PREFIX_SIZE];
    let digits = data.len().to_string();
    prefix[..digits.len()].copy_from_slice(digits.as_bytes());
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(data);
    buf.push(b'\n');
}

/// Parses a 10-byte length prefix: one or more ASCII digits followed by
/// space padding, value > 0. Returns `None` on any malformation.
fn parse_len_prefix(prefix: &[u8]) -> Option<u64> {
    debug_assert_eq!(prefix.len(), LEN_PREFIX_SIZE);
    let digits = prefix.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || prefix[digits..].iter().any(|&b| b != b' ') {
        return None;
    }
    let mut value: u64 = 0;
    for &b in &prefix[..digits] {
        value = value * 10 + u64::from(b - b'0');
    }
    (value > 0).then_some(value)
}

/// Shared frame validation: expected-size cross-check and torn-write bound.
fn check_frame(
    position: u64,
    length: u64,
    expected_size: Option<u64>,
    size: u64,
) -> Result<(), StorageError> {
    if let Some(expected) = expected_size {
        let actual = length + FRAME_OVERHEAD;
        if expected != actual {
            return Err(StorageError::InvalidDataSize { expected, actual });
        }
    }
    if position + length + FRAME_OVERHEAD > size {
        return Err(StorageError::CorruptFile { position });
    }
    Ok(())
}
