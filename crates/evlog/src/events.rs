//! Store notifications.
//!
//! Components publish what happened; subscribers registered on the
//! [`EventStore`](crate::EventStore) observe it. Subscribers are owned by
//! the store and dropped with it, so there are no cycles back into the
//! engine.

/// A notification emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The store finished opening and is ready for commits.
    Opened,
    /// The store was closed.
    Closed,
    /// A partition file was created for a new write stream.
    PartitionCreated { partition: String },
    /// A secondary index was created for a new read stream.
    IndexCreated { stream: String },
    /// A document was appended to a write stream.
    Wrote {
        stream: String,
        sequence: u64,
        position: u64,
    },
    /// An entry was appended to a read stream's index.
    IndexAdd { stream: String, number: u64 },
    /// A partition lost a torn or unreferenced suffix during recovery.
    /// Sizes are body bytes.
    PartitionTruncated {
        partition: String,
        prev_size: u64,
        new_size: u64,
    },
    /// An index was truncated during recovery or rewritten by a reindex.
    /// Lengths are entry counts; for a reindex, `new_length` is the rebuilt
    /// length.
    Truncated {
        stream: String,
        prev_length: u64,
        new_length: u64,
    },
    /// A consumer reached the head of its stream.
    CaughtUp { stream: String, consumer: String },
    /// A consumer checkpoint was persisted.
    Persisted { stream: String, consumer: String },
    /// A consumer handler failed; the consumer was stopped.
    ConsumerError {
        stream: String,
        consumer: String,
        message: String,
    },
}

/// Subscriber callback for [`StoreEvent`]s.
pub type Subscriber = Box<dyn FnMut(&StoreEvent) + Send>;
