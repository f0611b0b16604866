//! Storage coordinator.
//!
//! [`Storage`] composes partitions and indexes into named streams:
//!
//! - one [`Partition`] per write stream, holding the documents,
//! - the **primary index** with one entry per committed document across the
//!   whole store, in global sequence order,
//! - one **secondary index** per read stream, a filtered subsequence of the
//!   primary index (every write stream implicitly owns a same-named read
//!   stream matching its partition),
//! - the durable stream catalog (`<storage>.streams`) recording matchers
//!   and write partitions.
//!
//! A writable instance holds an exclusive lock on `<storage>.lock` for the
//! lifetime of the store; the lock file doubles as an unclean-shutdown
//! marker. When it is still present at open, every partition is scanned for
//! torn writes and the indexes are truncated back to the last document that
//! survived.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use evlog_storage::{Index, IndexEntry, Partition, StorageError};
use evlog_types::{EventEnvelope, PartitionId};
use fs2::FileExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::events::StoreEvent;
use crate::matcher::{verify_fingerprint, Catalog, CatalogEntry, Matcher};

/// Name of the primary index; its file is `<storage>.primary.index`.
const PRIMARY_INDEX: &str = "primary";

/// Coordinates partitions, indexes and the stream catalog.
pub(crate) struct Storage {
    pub(crate) config: StoreConfig,

    lock: Option<File>,
    lock_path: PathBuf,

    /// Partition name -> open partition.
    pub(crate) partitions: HashMap<String, Partition>,
    /// Partition id -> partition name.
    pub(crate) partition_names: HashMap<u32, String>,

    /// One entry per committed document, in global sequence order.
    pub(crate) primary: Index,
    /// Read-stream name -> secondary index.
    pub(crate) indexes: HashMap<String, Index>,
    /// Read-stream name -> matcher deciding membership.
    pub(crate) matchers: HashMap<String, Matcher>,

    pub(crate) catalog: Catalog,

    /// Committed-document count per partition id; the head revision of the
    /// owning write stream.
    pub(crate) versions: HashMap<u32, u64>,
    /// Last assigned global sequence number (== primary length).
    pub(crate) sequence: u64,

    /// Truncations performed by open-path recovery, before any subscriber
    /// could attach. The event store replays them on subscribe.
    pub(crate) recovery_notifications: Vec<StoreEvent>,

    pub(crate) closed: bool,
}

impl Storage {
    /// Opens the store directory, acquiring the writer lock unless the
    /// configuration asks for a read-only instance.
    pub(crate) fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.data_dir)?;

        let lock_path = config.data_dir.join(format!("{}.lock", config.storage_name));
        let (lock, unclean) = if config.read_only {
            (None, false)
        } else {
            // The lock file is removed on clean close; finding it here means
            // the previous writer died and the tail may be torn.
            let unclean = lock_path.exists();
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            file.try_lock_exclusive().map_err(|_| StoreError::LockHeld {
                path: lock_path.clone(),
            })?;
            (Some(file), unclean)
        };

        let primary = Index::open(
            config
                .data_dir
                .join(format!("{}.{PRIMARY_INDEX}.index", config.storage_name)),
            PRIMARY_INDEX,
            None,
            config.index_config(),
        )?;

        let catalog_path = config
            .data_dir
            .join(format!("{}.streams", config.storage_name));
        let catalog: Catalog = if catalog_path.exists() {
            serde_json::from_slice(&fs::read(&catalog_path)?)?
        } else {
            Catalog::default()
        };

        let mut storage = Self {
            config,
            lock,
            lock_path,
            partitions: HashMap::new(),
            partition_names: HashMap::new(),
            primary,
            indexes: HashMap::new(),
            matchers: HashMap::new(),
            catalog,
            versions: HashMap::new(),
            sequence: 0,
            recovery_notifications: Vec::new(),
            closed: false,
        };

        for entry in storage.catalog.streams.clone() {
            if let Some(secret) = &storage.config.catalog_secret {
                if !verify_fingerprint(secret, &entry) {
                    return Err(StoreError::FingerprintMismatch {
                        stream: entry.stream,
                    });
                }
            }
            if let Some(partition_name) = &entry.write_partition {
                storage.open_partition(partition_name)?;
                storage.matchers.insert(
                    entry.stream.clone(),
                    Matcher::Partition(PartitionId::from_name(partition_name)),
                );
            } else if let Some(value) = &entry.matcher {
                let matcher = Matcher::fields(value).ok_or_else(|| {
                    StoreError::InvalidArgument(format!(
                        "persisted matcher for stream {} is not an object",
                        entry.stream
                    ))
                })?;
                storage.matchers.insert(entry.stream.clone(), matcher);
            }
            // Predicate streams stay in the catalog without a matcher; the
            // predicate must be re-registered before new commits match.
            storage.open_index(&entry.stream, None)?;
        }

        if unclean {
            info!(storage = %storage.config.storage_name, "unclean shutdown detected");
            storage.recovery_notifications = storage.recover()?;
        }

        storage.rebuild_positions()?;
        debug!(
            storage = %storage.config.storage_name,
            sequence = storage.sequence,
            streams = storage.indexes.len(),
            "storage opened"
        );

        Ok(storage)
    }

    pub(crate) fn file_path(&self, suffix: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.{suffix}", self.config.storage_name))
    }

    /// Opens a partition lazily, registering its id mapping.
    pub(crate) fn open_partition(&mut self, name: &str) -> Result<(), StoreError> {
        if self.partitions.contains_key(name) {
            return Ok(());
        }
        let partition = Partition::open(
            self.file_path(name),
            name,
            self.config.partition_config(),
        )?;
        self.partition_names
            .insert(partition.id().as_u32(), name.to_string());
        self.partitions.insert(name.to_string(), partition);
        Ok(())
    }

    /// Opens a secondary index lazily. `metadata` is only written on
    /// creation; reopening validates it when given.
    pub(crate) fn open_index(
        &mut self,
        stream: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        if self.indexes.contains_key(stream) {
            return Ok(());
        }
        let index = Index::open(
            self.file_path(&format!("{stream}.index")),
            stream,
            metadata,
            self.config.index_config(),
        )?;
        self.indexes.insert(stream.to_string(), index);
        Ok(())
    }

    /// Resolves the write stream, creating its partition, implicit read
    /// stream and catalog entry on first use.
    ///
    /// Returns the partition id and whether the stream was newly created.
    pub(crate) fn ensure_write_stream(
        &mut self,
        stream: &str,
    ) -> Result<(u32, bool), StoreError> {
        let partition_name = (self.config.partitioner)(stream);
        let partition_id = PartitionId::from_name(&partition_name);

        if self.partitions.contains_key(&partition_name) && self.indexes.contains_key(stream) {
            return Ok((partition_id.as_u32(), false));
        }

        self.open_partition(&partition_name)?;
        let metadata = json!({"stream": stream, "partition": partition_name});
        self.open_index(stream, Some(&metadata))?;
        self.matchers
            .insert(stream.to_string(), Matcher::Partition(partition_id));

        if !self.catalog.streams.iter().any(|e| e.stream == stream) {
            self.catalog.streams.push(CatalogEntry {
                stream: stream.to_string(),
                write_partition: Some(partition_name),
                matcher: None,
                fingerprint: None,
            });
            self.save_catalog()?;
        }

        Ok((partition_id.as_u32(), true))
    }

    /// Reads and deserializes the document an index entry points at.
    pub(crate) fn read_entry(&mut self, entry: &IndexEntry) -> Result<EventEnvelope, StoreError> {
        let name = self
            .partition_names
            .get(&entry.partition)
            .ok_or(StorageError::CorruptFile {
                position: entry.position,
            })?
            .clone();
        let partition = self
            .partitions
            .get_mut(&name)
            .expect("named partitions are open");
        let doc = partition
            .read_from(entry.position, Some(u64::from(entry.size)))?
            .ok_or(StorageError::CorruptFile {
                position: entry.position,
            })?;
        Ok(self.config.serializer.deserialize(&doc)?)
    }

    /// Writes the stream catalog atomically (temp file + rename).
    pub(crate) fn save_catalog(&self) -> Result<(), StoreError> {
        let path = self.file_path("streams");
        let tmp = self.file_path("streams.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.catalog)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Recomputes the global sequence and per-partition versions from the
    /// primary index.
    pub(crate) fn rebuild_positions(&mut self) -> Result<(), StoreError> {
        self.sequence = self.primary.len();
        self.versions.clear();
        for n in 1..=self.primary.len() {
            let entry = self.primary.get(n)?.expect("entry within bounds");
            *self.versions.entry(entry.partition).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Torn-write recovery after an unclean shutdown.
    ///
    /// Scans every partition for the last complete document, then truncates
    /// the primary index back to the last entry whose document survived, the
    /// secondary indexes back to the same sequence number, and each
    /// partition past its last referenced document.
    ///
    /// Returns one notification per truncated partition and index, for the
    /// event store to surface to subscribers.
    fn recover(&mut self) -> Result<Vec<StoreEvent>, StoreError> {
        let mut notifications = Vec::new();

        for partition in self.partitions.values_mut() {
            let prev_size = partition.size();
            let recovered = partition.recover()?;
            if recovered < prev_size {
                notifications.push(StoreEvent::PartitionTruncated {
                    partition: partition.name().to_string(),
                    prev_size,
                    new_size: recovered,
                });
            }
        }

        let length = self.primary.len();
        let mut valid = length;
        for n in 1..=length {
            let entry = self.primary.get(n)?.expect("entry within bounds");
            let intact = self
                .partition_names
                .get(&entry.partition)
                .and_then(|name| self.partitions.get(name))
                .is_some_and(|p| entry.position + u64::from(entry.size) <= p.size());
            if !intact {
                valid = n - 1;
                break;
            }
        }

        if valid == length {
            return Ok(notifications);
        }
        warn!(
            storage = %self.config.storage_name,
            prev = length,
            new = valid,
            "primary index references torn documents, truncating"
        );

        let last_sequence = if valid == 0 {
            0
        } else {
            self.primary.get(valid)?.expect("entry within bounds").number
        };
        self.primary.truncate(valid)?;
        notifications.push(StoreEvent::Truncated {
            stream: PRIMARY_INDEX.to_string(),
            prev_length: length,
            new_length: valid,
        });

        for (stream, index) in self.indexes.iter_mut() {
            let prev_length = index.len();
            let keep = index.find(last_sequence)?;
            index.truncate(keep)?;
            if keep < prev_length {
                notifications.push(StoreEvent::Truncated {
                    stream: stream.clone(),
                    prev_length,
                    new_length: keep,
                });
            }
        }

        // Drop documents no entry references any more.
        let mut ends: HashMap<u32, u64> = HashMap::new();
        for n in 1..=valid {
            let entry = self.primary.get(n)?.expect("entry within bounds");
            ends.insert(entry.partition, entry.position + u64::from(entry.size));
        }
        for partition in self.partitions.values_mut() {
            let end = ends.get(&partition.id().as_u32()).copied().unwrap_or(0);
            let prev_size = partition.size();
            partition.truncate(end)?;
            if end < prev_size {
                notifications.push(StoreEvent::PartitionTruncated {
                    partition: partition.name().to_string(),
                    prev_size,
                    new_size: end,
                });
            }
        }

        Ok(notifications)
    }

    /// Reloads on-disk state in a read-only instance: new catalog entries,
    /// grown partitions and indexes.
    pub(crate) fn refresh(&mut self) -> Result<(), StoreError> {
        let catalog_path = self.file_path("streams");
        if catalog_path.exists() {
            let catalog: Catalog = serde_json::from_slice(&fs::read(&catalog_path)?)?;
            for entry in catalog.streams.clone() {
                if self.indexes.contains_key(&entry.stream) {
                    continue;
                }
                if let Some(secret) = &self.config.catalog_secret {
                    if !verify_fingerprint(secret, &entry) {
                        return Err(StoreError::FingerprintMismatch {
                            stream: entry.stream,
                        });
                    }
                }
                if let Some(partition_name) = &entry.write_partition {
                    self.open_partition(partition_name)?;
                    self.matchers.insert(
                        entry.stream.clone(),
                        Matcher::Partition(PartitionId::from_name(partition_name)),
                    );
                } else if let Some(value) = &entry.matcher {
                    if let Some(matcher) = Matcher::fields(value) {
                        self.matchers.insert(entry.stream.clone(), matcher);
                    }
                }
                self.open_index(&entry.stream, None)?;
            }
            self.catalog = catalog;
        }

        for partition in self.partitions.values_mut() {
            partition.refresh()?;
        }
        self.primary.refresh()?;
        for index in self.indexes.values_mut() {
            index.refresh()?;
        }
        self.rebuild_positions()?;
        Ok(())
    }

    /// Rebuilds the primary and every secondary index by rescanning the
    /// partitions in commit order.
    ///
    /// Documents are ordered by `(committed_at, commit_id, commit_version)`,
    /// re-deriving the global sequence the primary index normally records.
    ///
    /// Returns one truncate notification per rewritten index carrying the
    /// length before the rebuild and after it.
    pub(crate) fn reindex(&mut self) -> Result<Vec<StoreEvent>, StoreError> {
        struct Scanned {
            committed_at: u64,
            commit_id: uuid::Uuid,
            commit_version: u32,
            envelope: EventEnvelope,
            partition: u32,
            position: u64,
            size: u32,
        }

        let mut documents = Vec::new();
        for partition in self.partitions.values_mut() {
            let partition_id = partition.id().as_u32();
            let mut position = 0;
            for doc in partition.read_all() {
                let doc = doc?;
                let size = doc.len() as u64 + evlog_storage::FRAME_OVERHEAD;
                let envelope = self.config.serializer.deserialize(&doc)?;
                documents.push(Scanned {
                    committed_at: envelope.metadata.committed_at,
                    commit_id: envelope.metadata.commit_id,
                    commit_version: envelope.metadata.commit_version,
                    envelope,
                    partition: partition_id,
                    position,
                    size: size as u32,
                });
                position += size;
            }
        }
        documents.sort_by(|a, b| {
            (a.committed_at, a.commit_id, a.commit_version)
                .cmp(&(b.committed_at, b.commit_id, b.commit_version))
        });

        let primary_prev = self.primary.len();
        let prev_lengths: Vec<(String, u64)> = self
            .indexes
            .iter()
            .map(|(stream, index)| (stream.clone(), index.len()))
            .collect();

        self.primary.truncate(0)?;
        for index in self.indexes.values_mut() {
            index.truncate(0)?;
        }

        for (offset, doc) in documents.iter().enumerate() {
            let entry = IndexEntry {
                number: offset as u64 + 1,
                position: doc.position,
                size: doc.size,
                partition: doc.partition,
            };
            self.primary.add(entry)?;
            for (stream, index) in self.indexes.iter_mut() {
                let Some(matcher) = self.matchers.get(stream) else {
                    continue;
                };
                if matcher.matches(&doc.envelope, PartitionId::new(doc.partition)) {
                    index.add(entry)?;
                }
            }
        }

        self.primary.flush()?;
        for index in self.indexes.values_mut() {
            index.flush()?;
        }
        self.rebuild_positions()?;

        let mut notifications = Vec::new();
        if primary_prev > 0 {
            notifications.push(StoreEvent::Truncated {
                stream: PRIMARY_INDEX.to_string(),
                prev_length: primary_prev,
                new_length: self.primary.len(),
            });
        }
        for (stream, prev_length) in prev_lengths {
            if prev_length == 0 {
                continue;
            }
            let new_length = self
                .indexes
                .get(&stream)
                .map(|index| index.len())
                .unwrap_or(0);
            notifications.push(StoreEvent::Truncated {
                stream,
                prev_length,
                new_length,
            });
        }

        info!(
            storage = %self.config.storage_name,
            documents = documents.len(),
            "reindex complete"
        );
        Ok(notifications)
    }

    /// Flushes everything, closes every component and releases the lock.
    ///
    /// Removing the lock file marks the shutdown as clean.
    pub(crate) fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        for partition in self.partitions.values_mut() {
            partition.close()?;
        }
        self.primary.close()?;
        for index in self.indexes.values_mut() {
            index.close()?;
        }
        if let Some(lock) = self.lock.take() {
            let _ = fs2::FileExt::unlock(&lock);
            drop(lock);
            if let Err(e) = fs::remove_file(&self.lock_path) {
                warn!(error = %e, "failed to remove lock file");
            }
        }
        self.closed = true;
        debug!(storage = %self.config.storage_name, "storage closed");
        Ok(())
    }
}
