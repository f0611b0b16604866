//! Store configuration.

use std::path::PathBuf;
use std::sync::Arc;

use evlog_storage::{IndexConfig, PartitionConfig};
use evlog_types::{JsonSerializer, Serializer};

/// Maps a write-stream name to the partition that stores its documents.
///
/// The default partitioner uses the stream name itself.
pub type Partitioner = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Configuration for opening an event store.
///
/// # Example
///
/// ```ignore
/// let config = StoreConfig::new("./data")
///     .with_storage_name("orders")
///     .with_sync_on_flush(true)
///     .with_catalog_secret("s3cret");
/// let store = EventStore::open(config)?;
/// ```
#[derive(Clone)]
pub struct StoreConfig {
    /// Directory holding every store file.
    pub data_dir: PathBuf,
    /// File-name prefix shared by all store files (`<name>.lock`,
    /// `<name>.<partition>`, `<name>.<stream>.index`, ...).
    pub storage_name: String,
    /// Open without the directory lock; the instance can only read.
    pub read_only: bool,
    /// Serve reads from unflushed write buffers.
    pub dirty_reads: bool,
    /// Call the OS sync after each flush.
    pub sync_on_flush: bool,
    /// Partition write buffer capacity in bytes.
    pub write_buffer_size: usize,
    /// Partition read buffer capacity in bytes.
    pub read_buffer_size: usize,
    /// Flush partitions once this many documents are buffered (0 = off).
    pub max_write_buffer_documents: usize,
    /// Cached index read pages per index.
    pub index_page_cache_size: usize,
    /// Secret for HMAC fingerprints over persisted matchers. Without it the
    /// catalog is written unfingerprinted and accepted unverified.
    pub catalog_secret: Option<String>,
    /// Document serializer; JSON by default.
    pub serializer: Arc<dyn Serializer>,
    /// Write-stream to partition-name mapping.
    pub partitioner: Partitioner,
}

impl StoreConfig {
    /// Creates a configuration with defaults for the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let partition_defaults = PartitionConfig::default();
        let index_defaults = IndexConfig::default();
        Self {
            data_dir: data_dir.into(),
            storage_name: "storage".to_string(),
            read_only: false,
            dirty_reads: true,
            sync_on_flush: false,
            write_buffer_size: partition_defaults.write_buffer_size,
            read_buffer_size: partition_defaults.read_buffer_size,
            max_write_buffer_documents: partition_defaults.max_write_buffer_documents,
            index_page_cache_size: index_defaults.page_cache_size,
            catalog_secret: None,
            serializer: Arc::new(JsonSerializer),
            partitioner: Arc::new(|stream: &str| stream.to_string()),
        }
    }

    /// Sets the file-name prefix.
    pub fn with_storage_name(mut self, name: impl Into<String>) -> Self {
        self.storage_name = name.into();
        self
    }

    /// Opens the store without the writer lock.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Enables or disables reads from unflushed buffers.
    pub fn with_dirty_reads(mut self, dirty_reads: bool) -> Self {
        self.dirty_reads = dirty_reads;
        self
    }

    /// Enables the OS sync after each flush.
    pub fn with_sync_on_flush(mut self, sync_on_flush: bool) -> Self {
        self.sync_on_flush = sync_on_flush;
        self
    }

    /// Sets the partition write buffer capacity.
    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Sets the partition read buffer capacity.
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    /// Flush partitions after this many buffered documents.
    pub fn with_max_write_buffer_documents(mut self, documents: usize) -> Self {
        self.max_write_buffer_documents = documents;
        self
    }

    /// Sets the fingerprint secret for the persisted stream catalog.
    pub fn with_catalog_secret(mut self, secret: impl Into<String>) -> Self {
        self.catalog_secret = Some(secret.into());
        self
    }

    /// Replaces the document serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replaces the write-stream to partition mapping.
    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub(crate) fn partition_config(&self) -> PartitionConfig {
        PartitionConfig {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            max_write_buffer_documents: self.max_write_buffer_documents,
            sync_on_flush: self.sync_on_flush,
            dirty_reads: self.dirty_reads,
        }
    }

    pub(crate) fn index_config(&self) -> IndexConfig {
        IndexConfig {
            page_cache_size: self.index_page_cache_size,
            sync_on_flush: self.sync_on_flush,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("data_dir", &self.data_dir)
            .field("storage_name", &self.storage_name)
            .field("read_only", &self.read_only)
            .field("dirty_reads", &self.dirty_reads)
            .field("sync_on_flush", &self.sync_on_flush)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("read_buffer_size", &self.read_buffer_size)
            .finish_non_exhaustive()
    }
}
