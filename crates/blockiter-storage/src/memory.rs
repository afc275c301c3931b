//! In-memory index store.
//!
//! Holds the committed snapshot in RAM. Useful for tests and for runs without
//! a cache directory, where nothing needs to outlive the process.

use blockiter_core::error::IterError;
use blockiter_core::index::{CacheSnapshot, IndexCacheEntry, IndexStore, ScanState};

/// In-memory index store.
///
/// Appends stay queued until [`IndexStore::flush`], mirroring the durable
/// backends, so a run that fails before flushing leaves the snapshot as it was.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    committed: CacheSnapshot,
    queued: Vec<IndexCacheEntry>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: CacheSnapshot) -> Self {
        Self {
            committed: snapshot,
            queued: Vec::new(),
        }
    }

    /// The committed state.
    pub fn snapshot(&self) -> &CacheSnapshot {
        &self.committed
    }

    pub fn into_snapshot(self) -> CacheSnapshot {
        self.committed
    }

    fn commit_queued(&mut self) {
        for entry in self.queued.drain(..) {
            if !self.committed.entries.iter().any(|e| e.hash == entry.hash) {
                self.committed.entries.push(entry);
            }
        }
    }
}

impl IndexStore for MemoryIndexStore {
    fn load(&mut self) -> Result<CacheSnapshot, IterError> {
        self.queued.clear();
        Ok(self.committed.clone())
    }

    fn append(&mut self, entry: IndexCacheEntry) -> Result<(), IterError> {
        self.queued.push(entry);
        Ok(())
    }

    fn truncate(&mut self, height: u32) -> Result<(), IterError> {
        self.commit_queued();
        self.committed.truncate(height);
        Ok(())
    }

    fn flush(&mut self, state: &ScanState) -> Result<(), IterError> {
        self.commit_queued();
        self.committed.apply(state);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), IterError> {
        self.committed = CacheSnapshot::default();
        self.queued.clear();
        Ok(())
    }
}
