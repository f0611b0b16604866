//! The event store.
//!
//! [`EventStore`] is the write-side API over the storage coordinator:
//! optimistic-concurrency commits, stream creation by matcher, bounded
//! stream iteration, durable consumers and store notifications.
//!
//! # Commit path
//!
//! A commit wraps each event in an envelope carrying the commit id,
//! timestamp and stream revision, serializes it, appends it to the write
//! stream's partition, records one primary-index entry per document and one
//! secondary-index entry per accepting read stream, then flushes everything
//! in a single I/O burst and dispatches to live consumers.
//!
//! # Example
//!
//! ```ignore
//! use evlog::{EventStore, StoreConfig};
//! use evlog_types::ExpectedRevision;
//! use serde_json::json;
//!
//! let mut store = EventStore::open(StoreConfig::new("./data"))?;
//! store.commit("orders", vec![json!({"op": "created"})], ExpectedRevision::NoStream, None)?;
//! let events = store.event_stream("orders")?.events()?;
//! store.close()?;
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use evlog_storage::{IndexEntry, FRAME_OVERHEAD};
use evlog_types::{
    CommitResult, EventEnvelope, EventMetadata, ExpectedRevision, PartitionId, SequenceNumber,
};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::consumer::{Consumer, ConsumerContext, ConsumerHandler};
use crate::error::StoreError;
use crate::events::{StoreEvent, Subscriber};
use crate::matcher::{fingerprint, CatalogEntry, Matcher};
use crate::storage::Storage;
use crate::stream::{EventStream, JoinEventStream};

/// An embedded, single-writer event store.
pub struct EventStore {
    storage: Storage,
    consumers: Vec<Consumer>,
    subscribers: Vec<Subscriber>,
    /// Notifications from the open path (`Opened` plus any recovery
    /// truncations), replayed to each subscriber when it attaches.
    startup_notifications: Vec<StoreEvent>,
}

impl EventStore {
    /// Opens (or creates) the store described by `config`.
    ///
    /// A writable instance takes the directory lock and recovers torn
    /// writes left by an unclean shutdown; a read-only instance takes no
    /// lock and observes the directory passively.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockHeld`] when another writer owns the directory.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut storage = Storage::open(config)?;
        let mut startup_notifications = vec![StoreEvent::Opened];
        startup_notifications.append(&mut storage.recovery_notifications);
        Ok(Self {
            storage,
            consumers: Vec::new(),
            subscribers: Vec::new(),
            startup_notifications,
        })
    }

    /// Registers a subscriber for store notifications.
    ///
    /// Open-path notifications (`Opened` and any recovery truncations)
    /// happen before a subscriber can attach; they are replayed to the new
    /// subscriber here.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&StoreEvent) + Send + 'static) {
        let mut subscriber: Subscriber = Box::new(subscriber);
        for event in &self.startup_notifications {
            subscriber(event);
        }
        self.subscribers.push(subscriber);
    }

    fn emit(&mut self, event: &StoreEvent) {
        Self::emit_to(&mut self.subscribers, event);
    }

    fn emit_to(subscribers: &mut [Subscriber], event: &StoreEvent) {
        for subscriber in subscribers.iter_mut() {
            subscriber(event);
        }
    }

    /// The current head revision of a write stream (0 for an unknown or
    /// empty stream).
    pub fn stream_version(&self, stream: &str) -> u64 {
        let partition = (self.storage.config.partitioner)(stream);
        self.storage
            .versions
            .get(&PartitionId::from_name(&partition).as_u32())
            .copied()
            .unwrap_or(0)
    }

    /// The last assigned global sequence number.
    pub fn sequence(&self) -> u64 {
        self.storage.sequence
    }

    /// Commits one or more events to a write stream.
    ///
    /// All events share one commit id and timestamp; `expected` is checked
    /// against the stream head before anything is written. The write
    /// stream, its partition and its implicit read stream are created on
    /// first use.
    ///
    /// # Errors
    ///
    /// - [`StoreError::OptimisticConcurrency`] - the head moved past
    ///   `expected`
    /// - [`StoreError::InvalidArgument`] - empty stream name or event list
    /// - [`StoreError::ReadOnly`] / [`StoreError::Closed`]
    pub fn commit(
        &mut self,
        stream: &str,
        events: Vec<Value>,
        expected: ExpectedRevision,
        commit_metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<CommitResult, StoreError> {
        if self.storage.closed {
            return Err(StoreError::Closed);
        }
        if self.storage.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if stream.is_empty() {
            return Err(StoreError::InvalidArgument(
                "stream name must not be empty".to_string(),
            ));
        }
        if events.is_empty() {
            return Err(StoreError::InvalidArgument(
                "commit requires at least one event".to_string(),
            ));
        }

        let (partition_id, created) = self.storage.ensure_write_stream(stream)?;
        if created {
            let partition = self.storage.partition_names[&partition_id].clone();
            self.emit(&StoreEvent::PartitionCreated { partition });
            self.emit(&StoreEvent::IndexCreated {
                stream: stream.to_string(),
            });
        }

        let current = self
            .storage
            .versions
            .get(&partition_id)
            .copied()
            .unwrap_or(0);
        let expected_version = match expected {
            ExpectedRevision::Any => None,
            ExpectedRevision::NoStream => Some(0),
            ExpectedRevision::Exact(revision) => Some(revision.as_u64()),
        };
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StoreError::OptimisticConcurrency {
                    stream: stream.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        let commit_id = Uuid::new_v4();
        let committed_at = unix_millis();
        let commit_size = events.len() as u32;
        let first_sequence = self.storage.sequence + 1;
        let partition_name = self.storage.partition_names[&partition_id].clone();

        let mut notifications = Vec::with_capacity(events.len());
        for (offset, payload) in events.into_iter().enumerate() {
            let envelope = EventEnvelope {
                payload,
                metadata: EventMetadata {
                    commit_id,
                    committed_at,
                    commit_version: offset as u32,
                    commit_size,
                    stream_version: current + offset as u64 + 1,
                    extra: commit_metadata.clone().unwrap_or_default(),
                },
            };
            let bytes = self.storage.config.serializer.serialize(&envelope)?;

            let partition = self
                .storage
                .partitions
                .get_mut(&partition_name)
                .expect("write stream resolved above");
            let position = partition.write(&bytes)?;

            let sequence = self.storage.sequence + 1;
            let entry = IndexEntry {
                number: sequence,
                position,
                size: (bytes.len() as u64 + FRAME_OVERHEAD) as u32,
                partition: partition_id,
            };
            self.storage.primary.add(entry)?;
            self.storage.sequence = sequence;
            *self.storage.versions.entry(partition_id).or_insert(0) += 1;

            let mut matched = Vec::new();
            for (name, index) in self.storage.indexes.iter_mut() {
                let Some(matcher) = self.storage.matchers.get(name) else {
                    continue;
                };
                if matcher.matches(&envelope, PartitionId::new(partition_id)) {
                    index.add(entry)?;
                    matched.push(name.clone());
                }
            }
            notifications.push((sequence, position, matched));
        }

        // One I/O burst for the whole commit.
        self.storage
            .partitions
            .get_mut(&partition_name)
            .expect("write stream resolved above")
            .flush()?;
        self.storage.primary.flush()?;
        for index in self.storage.indexes.values_mut() {
            index.flush()?;
        }

        let last_sequence = self.storage.sequence;
        for (sequence, position, matched) in notifications {
            Self::emit_to(
                &mut self.subscribers,
                &StoreEvent::Wrote {
                    stream: stream.to_string(),
                    sequence,
                    position,
                },
            );
            for name in matched {
                Self::emit_to(
                    &mut self.subscribers,
                    &StoreEvent::IndexAdd {
                        stream: name,
                        number: sequence,
                    },
                );
            }
        }

        debug!(
            stream,
            commit = %commit_id,
            first = first_sequence,
            last = last_sequence,
            "commit flushed"
        );
        self.dispatch()?;

        Ok(CommitResult {
            commit_id,
            first_sequence: SequenceNumber::new(first_sequence),
            last_sequence: SequenceNumber::new(last_sequence),
        })
    }

    /// Creates a read stream from a matcher.
    ///
    /// The primary index is replayed from entry 1 so the new stream covers
    /// documents committed before its creation. Field matchers persist in
    /// the catalog (fingerprinted when a secret is configured); predicate
    /// matchers are recorded by name only and must be re-registered with
    /// [`Self::restore_stream`] after a reopen.
    ///
    /// # Errors
    ///
    /// [`StoreError::StreamExists`] for a duplicate name.
    pub fn create_stream(&mut self, name: &str, matcher: Matcher) -> Result<(), StoreError> {
        if self.storage.closed {
            return Err(StoreError::Closed);
        }
        if self.storage.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "stream name must not be empty".to_string(),
            ));
        }
        if self.storage.indexes.contains_key(name)
            || self.storage.catalog.streams.iter().any(|e| e.stream == name)
        {
            return Err(StoreError::StreamExists(name.to_string()));
        }

        let persisted = matcher.persisted();
        let matcher_fingerprint = match (&persisted, &self.storage.config.catalog_secret) {
            (Some(value), Some(secret)) => Some(fingerprint(secret, value)),
            _ => None,
        };

        let metadata = serde_json::json!({"stream": name, "matcher": persisted});
        self.storage.open_index(name, Some(&metadata))?;

        // Replay existing documents through the matcher.
        let mut accepted = Vec::new();
        for n in 1..=self.storage.primary.len() {
            let entry = self.storage.primary.get(n)?.expect("entry within bounds");
            let envelope = self.storage.read_entry(&entry)?;
            if matcher.matches(&envelope, PartitionId::new(entry.partition)) {
                accepted.push(entry);
            }
        }
        let index = self
            .storage
            .indexes
            .get_mut(name)
            .expect("index opened above");
        for entry in accepted {
            index.add(entry)?;
        }
        index.flush()?;

        self.storage.matchers.insert(name.to_string(), matcher);
        self.storage.catalog.streams.push(CatalogEntry {
            stream: name.to_string(),
            write_partition: None,
            matcher: persisted,
            fingerprint: matcher_fingerprint,
        });
        self.storage.save_catalog()?;

        self.emit(&StoreEvent::IndexCreated {
            stream: name.to_string(),
        });
        Ok(())
    }

    /// Re-arms the predicate of a stream created with a predicate matcher.
    ///
    /// Predicates are not persistable; after a reopen, their streams exist
    /// in the catalog without a matcher and receive no new documents until
    /// restored.
    pub fn restore_stream(&mut self, name: &str, matcher: Matcher) -> Result<(), StoreError> {
        if !self.storage.indexes.contains_key(name) {
            return Err(StoreError::UnknownStream(name.to_string()));
        }
        self.storage.matchers.insert(name.to_string(), matcher);
        Ok(())
    }

    /// Returns the names of every known stream.
    pub fn streams(&self) -> Vec<&str> {
        self.storage.indexes.keys().map(String::as_str).collect()
    }

    /// Opens a bounded iterator over a read stream.
    pub fn event_stream(&mut self, stream: &str) -> Result<EventStream<'_>, StoreError> {
        EventStream::new(&mut self.storage, stream)
    }

    /// Opens a merged iterator over several write streams, preserving
    /// global insertion order.
    pub fn join_streams(&mut self, streams: &[&str]) -> Result<JoinEventStream<'_>, StoreError> {
        JoinEventStream::new(&mut self.storage, streams)
    }

    /// Rebuilds every index by rescanning the partitions in commit order.
    ///
    /// Subscribers receive one [`StoreEvent::Truncated`] per rewritten
    /// index.
    pub fn reindex(&mut self) -> Result<(), StoreError> {
        if self.storage.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let notifications = self.storage.reindex()?;
        for event in &notifications {
            Self::emit_to(&mut self.subscribers, event);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Registers a durable consumer on a read stream and dispatches it up
    /// to the current head.
    ///
    /// The consumer resumes from its checkpoint file if one exists.
    pub fn create_consumer<H>(
        &mut self,
        stream: &str,
        consumer_id: &str,
        initial_state: Value,
        handler: H,
    ) -> Result<(), StoreError>
    where
        H: FnMut(
                &EventEnvelope,
                &mut ConsumerContext,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + 'static,
    {
        if !self.storage.indexes.contains_key(stream) {
            return Err(StoreError::UnknownStream(stream.to_string()));
        }
        if self
            .consumers
            .iter()
            .any(|c| c.stream == stream && c.id == consumer_id)
        {
            return Err(StoreError::InvalidArgument(format!(
                "consumer {consumer_id} already registered on stream {stream}"
            )));
        }
        let path = self
            .storage
            .file_path(&format!("{stream}.{consumer_id}.state"));
        let consumer = Consumer::open(
            stream,
            consumer_id,
            path,
            initial_state,
            Box::new(handler) as ConsumerHandler,
        )?;
        self.consumers.push(consumer);
        self.dispatch()
    }

    /// The persisted state of a consumer (a defensive copy).
    pub fn consumer_state(&self, stream: &str, consumer_id: &str) -> Option<Value> {
        self.consumers
            .iter()
            .find(|c| c.stream == stream && c.id == consumer_id)
            .map(|c| c.state.clone())
    }

    /// The last dispatched position of a consumer.
    pub fn consumer_position(&self, stream: &str, consumer_id: &str) -> Option<u64> {
        self.consumers
            .iter()
            .find(|c| c.stream == stream && c.id == consumer_id)
            .map(|c| c.position)
    }

    /// Rewinds a consumer to `position` (0 = start), replacing its state
    /// with `state` or the initial state, then re-dispatches.
    pub fn reset_consumer(
        &mut self,
        stream: &str,
        consumer_id: &str,
        state: Option<Value>,
        position: u64,
    ) -> Result<(), StoreError> {
        let consumer = self
            .consumers
            .iter_mut()
            .find(|c| c.stream == stream && c.id == consumer_id)
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "no consumer {consumer_id} on stream {stream}"
                ))
            })?;
        consumer.reset(state, position)?;
        self.dispatch()
    }

    /// Removes a consumer, suspending its dispatch. The checkpoint file is
    /// kept; re-registering resumes where it left off.
    pub fn remove_consumer(&mut self, stream: &str, consumer_id: &str) {
        self.consumers
            .retain(|c| !(c.stream == stream && c.id == consumer_id));
    }

    /// Dispatches every active consumer up to the head of its stream.
    ///
    /// Commits call this automatically; read-only instances call it (via
    /// [`Self::refresh`]) when the directory watcher reports growth.
    pub fn catch_up(&mut self) -> Result<(), StoreError> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Result<(), StoreError> {
        for consumer in &mut self.consumers {
            if !consumer.active {
                continue;
            }

            // New entries since the last dispatch put the consumer behind
            // again; it re-announces catching up once it drains them.
            if let Some(index) = self.storage.indexes.get_mut(&consumer.stream) {
                if consumer.position < index.len() {
                    consumer.caught_up = false;
                }
            }

            loop {
                let head = match self.storage.indexes.get_mut(&consumer.stream) {
                    Some(index) => index.len(),
                    None => break,
                };
                if consumer.position >= head {
                    break;
                }
                let next = consumer.position + 1;
                let entry = self
                    .storage
                    .indexes
                    .get_mut(&consumer.stream)
                    .expect("checked above")
                    .get(next)?
                    .expect("entry within bounds");
                let envelope = self.storage.read_entry(&entry)?;

                let mut context = ConsumerContext::new(consumer.state.clone());
                match (consumer.handler)(&envelope, &mut context) {
                    Ok(()) => {
                        consumer.position = next;
                        let new_state = context.into_new_state();
                        let state_changed = new_state.is_some();
                        if let Some(state) = new_state {
                            consumer.state = state;
                        }
                        // Position and state land in one atomic write.
                        consumer.persist()?;
                        if state_changed {
                            Self::emit_to(
                                &mut self.subscribers,
                                &StoreEvent::Persisted {
                                    stream: consumer.stream.clone(),
                                    consumer: consumer.id.clone(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            stream = %consumer.stream,
                            consumer = %consumer.id,
                            error = %e,
                            "consumer handler failed, stopping consumer"
                        );
                        consumer.active = false;
                        Self::emit_to(
                            &mut self.subscribers,
                            &StoreEvent::ConsumerError {
                                stream: consumer.stream.clone(),
                                consumer: consumer.id.clone(),
                                message: e.to_string(),
                            },
                        );
                        break;
                    }
                }
            }

            let head = self
                .storage
                .indexes
                .get_mut(&consumer.stream)
                .map(|index| index.len())
                .unwrap_or(0);
            if consumer.active && consumer.position >= head && !consumer.caught_up {
                consumer.caught_up = true;
                Self::emit_to(
                    &mut self.subscribers,
                    &StoreEvent::CaughtUp {
                        stream: consumer.stream.clone(),
                        consumer: consumer.id.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reloads on-disk state and dispatches consumers.
    ///
    /// Read-only instances call this when the directory watcher reports a
    /// change.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        self.storage.refresh()?;
        self.dispatch()
    }

    /// Whether this instance was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.storage.config.read_only
    }

    /// Flushes everything, closes every file and releases the directory
    /// lock.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.storage.closed {
            return Ok(());
        }
        self.storage.close()?;
        self.emit(&StoreEvent::Closed);
        Ok(())
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("sequence", &self.storage.sequence)
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}

/// Milliseconds since the Unix epoch.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
