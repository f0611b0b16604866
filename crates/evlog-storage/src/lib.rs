//! # evlog-storage: Segment files and positional indexes
//!
//! This crate implements the byte-level storage layer of the evlog engine:
//!
//! - [`Partition`] - one append-only segment file holding length-prefixed
//!   documents with buffered writes, random-access reads, whole-suffix
//!   truncation and torn-write recovery.
//! - [`Index`] - one append-only file of fixed-size records mapping a
//!   1-based entry number to `(partition, position, size)` plus a monotone
//!   key, with range scans and key-based binary search.
//!
//! Both types know nothing about events or streams; the coordinator in the
//! `evlog` crate composes them into named write and read streams.
//!
//! # Example
//!
//! ```ignore
//! use evlog_storage::{Index, IndexConfig, IndexEntry, Partition, PartitionConfig};
//!
//! let mut partition = Partition::open("data/storage.orders", "orders", PartitionConfig::default())?;
//! let position = partition.write(b"{\"payload\":1}")?;
//! partition.flush()?;
//!
//! let mut index = Index::open("data/storage.orders.index", "orders", None, IndexConfig::default())?;
//! index.add(IndexEntry::new(1, position, 13 + 11, partition.id()))?;
//! index.flush()?;
//! ```

mod error;
mod index;
mod partition;

pub use error::StorageError;
pub use index::{Index, IndexConfig, IndexEntry, INDEX_ENTRY_SIZE};
pub use partition::{
    FlushCallback, Partition, PartitionConfig, ReadAll, FRAME_OVERHEAD, HEADER_SIZE,
    LEN_PREFIX_SIZE,
};
