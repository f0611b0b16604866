//! # evlog: an embedded, append-only event store
//!
//! A single-writer, multi-reader log-structured store for event-sourced
//! applications. Documents are immutable once committed; write streams
//! append to segment files, positional indexes order documents into
//! logical streams, and bounded iterators read them back with strict
//! consistency.
//!
//! # Architecture
//!
//! ```text
//! EventStore
//!   ├── Storage (coordinator)
//!   │     ├── Partition per write stream     <storage>.<name>
//!   │     ├── primary Index (global order)   <storage>.primary.index
//!   │     ├── secondary Index per stream     <storage>.<stream>.index
//!   │     └── stream catalog                 <storage>.streams
//!   ├── Consumers (durable cursors)          <storage>.<stream>.<id>.state
//!   └── Subscribers (StoreEvent notifications)
//! ```
//!
//! Exactly one writer owns a data directory, guarded by `<storage>.lock`;
//! read-only instances take no lock and follow the directory with a
//! [`DirectoryWatcher`].
//!
//! # Example
//!
//! ```ignore
//! use evlog::{EventStore, Matcher, StoreConfig};
//! use evlog_types::ExpectedRevision;
//! use serde_json::json;
//!
//! let mut store = EventStore::open(StoreConfig::new("./data"))?;
//!
//! store.commit(
//!     "orders",
//!     vec![json!({"type": "order-placed", "total": 42})],
//!     ExpectedRevision::NoStream,
//!     None,
//! )?;
//!
//! // A read stream over every commit carrying this metadata field.
//! store.create_stream("acme", Matcher::fields(&json!({"tenant": "acme"})).unwrap())?;
//!
//! for envelope in store.event_stream("orders")? {
//!     let envelope = envelope?;
//!     println!("{} @ {}", envelope.payload, envelope.metadata.stream_version);
//! }
//!
//! store.close()?;
//! ```

mod config;
mod consumer;
mod error;
mod event_store;
mod events;
mod matcher;
mod storage;
mod stream;
mod watcher;

pub use config::{Partitioner, StoreConfig};
pub use consumer::{ConsumerContext, ConsumerHandler};
pub use error::StoreError;
pub use event_store::EventStore;
pub use events::{StoreEvent, Subscriber};
pub use matcher::{Catalog, CatalogEntry, MatchFn, Matcher};
pub use stream::{EventStream, JoinEventStream};
pub use watcher::DirectoryWatcher;

pub use evlog_types::{
    CommitResult, EventEnvelope, EventMetadata, ExpectedRevision, JsonSerializer, PartitionId,
    SequenceNumber, Serializer, StreamRevision,
};

#[cfg(test)]
mod tests;
