//! Directory watching for read-only instances.
//!
//! A read-only store takes no lock and observes the writer through the
//! filesystem: the [`DirectoryWatcher`] reports when any store file in the
//! data directory changes, and the owner reacts by calling
//! [`EventStore::refresh`](crate::EventStore::refresh).
//!
//! Branching-related sidecars (`*.branch`) and in-flight temp files
//! (`*.tmp`) are ignored.
//!
//! # Example
//!
//! ```ignore
//! let mut store = EventStore::open(StoreConfig::new("./data").read_only())?;
//! let watcher = DirectoryWatcher::new("./data", "storage")?;
//!
//! while watcher.changed(Duration::from_secs(1)) {
//!     store.refresh()?;
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::error::StoreError;

/// Watches a data directory for changes to one store's files.
pub struct DirectoryWatcher {
    // Held for its Drop; dropping stops the watch.
    _watcher: RecommendedWatcher,
    receiver: Receiver<()>,
}

impl DirectoryWatcher {
    /// Starts watching `data_dir` for files belonging to `storage_name`.
    pub fn new(
        data_dir: impl AsRef<Path>,
        storage_name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let storage_name = storage_name.into();
        let prefix = format!("{storage_name}.");
        let (sender, receiver) = mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
                let Ok(event) = event else {
                    return;
                };
                if event.paths.iter().any(|path| is_store_file(path, &prefix)) {
                    // A full channel or a dropped receiver are both fine to
                    // ignore; the signal is level-triggered.
                    let _ = sender.send(());
                }
            })?;
        watcher.watch(data_dir.as_ref(), RecursiveMode::NonRecursive)?;
        debug!(dir = %data_dir.as_ref().display(), storage = %storage_name, "watching directory");

        Ok(Self {
            _watcher: watcher,
            receiver,
        })
    }

    /// Blocks up to `timeout` for a change, draining coalesced signals.
    pub fn changed(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(()) => {
                self.drain();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns immediately whether a change was reported since the last
    /// call.
    pub fn try_changed(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(()) => {
                self.drain();
                true
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }

    fn drain(&self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// A path is relevant when it belongs to this store and is neither a
/// branch sidecar nor a temp file.
fn is_store_file(path: &PathBuf, prefix: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(prefix) && !name.ends_with(".branch") && !name.ends_with(".tmp")
}

#[cfg(test)]
mod watcher_tests {
    use super::*;

    #[test]
    fn store_files_are_recognised() {
        let prefix = "storage.";
        assert!(is_store_file(&PathBuf::from("/d/storage.orders"), prefix));
        assert!(is_store_file(&PathBuf::from("/d/storage.orders.index"), prefix));
        assert!(is_store_file(&PathBuf::from("/d/storage.streams"), prefix));
    }

    #[test]
    fn sidecars_and_foreign_files_are_ignored() {
        let prefix = "storage.";
        assert!(!is_store_file(&PathBuf::from("/d/storage.orders.branch"), prefix));
        assert!(!is_store_file(&PathBuf::from("/d/storage.streams.tmp"), prefix));
        assert!(!is_store_file(&PathBuf::from("/d/other.orders"), prefix));
    }
}
