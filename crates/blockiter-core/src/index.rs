//! Index cache — persists linked blocks so later runs skip rescanning.
//!
//! An [`IndexCacheEntry`] records where a linked block lives and at which
//! height. The union of all entries is a forest rooted at genesis blocks; on
//! restart it is replayed into a fresh [`ChainAssembler`] and scanning resumes
//! at the persisted [`ScanCursor`]. Records still waiting for a parent are
//! persisted alongside, so they need not be rescanned.
//!
//! [`ChainAssembler`]: crate::chain::ChainAssembler

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cursor::ScanCursor;
use crate::error::IterError;
use crate::types::{BlockHash, BlockHeader, BlockRecord};

/// Version tag of the persisted layout. Bumped on incompatible changes.
pub const CACHE_FORMAT_VERSION: u32 = 2;

/// A persisted link: block identity, position, and height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCacheEntry {
    pub hash: BlockHash,
    pub height: u32,
    pub file_id: u32,
    pub offset: u64,
    /// Declared record length.
    pub length: u32,
    pub header: BlockHeader,
}

impl IndexCacheEntry {
    pub fn from_record(record: &BlockRecord, height: u32) -> Self {
        Self {
            hash: record.hash,
            height,
            file_id: record.file_id,
            offset: record.offset,
            length: record.length,
            header: record.header,
        }
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    pub fn position(&self) -> ScanCursor {
        ScanCursor::new(self.file_id, self.offset)
    }

    /// Rebuild the scanned record this entry was made from.
    pub fn to_record(&self) -> BlockRecord {
        BlockRecord {
            hash: self.hash,
            header: self.header,
            length: self.length,
            file_id: self.file_id,
            offset: self.offset,
        }
    }
}

/// What a block file looked like when it was last scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub len: u64,
    /// Modification time, nanoseconds since the Unix epoch. `None` when the
    /// platform does not report one.
    pub modified: Option<i64>,
    /// Every record before this offset was read: the end of the last
    /// complete record, or the start of a corrupt tail.
    pub scanned_to: u64,
}

impl FileFingerprint {
    /// Whether a file now reporting `len` and `modified` is unchanged.
    pub fn matches(&self, len: u64, modified: Option<i64>) -> bool {
        self.len == len && self.modified.is_some() && self.modified == modified
    }
}

/// Scan progress written by [`IndexStore::flush`] next to the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    pub cursor: ScanCursor,
    pub tip: Option<BlockHash>,
    pub files: BTreeMap<u32, FileFingerprint>,
    /// Records before the cursor whose parent has not been seen.
    pub orphans: Vec<BlockRecord>,
}

/// Everything a store knows, as returned by [`IndexStore::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Entries in append order; parents precede children.
    pub entries: Vec<IndexCacheEntry>,
    pub cursor: ScanCursor,
    /// Best tip at the last flush.
    pub tip: Option<BlockHash>,
    /// Block file id → fingerprint taken when it was scanned.
    pub files: BTreeMap<u32, FileFingerprint>,
    /// Unlinked records, ordered by position.
    pub orphans: Vec<BlockRecord>,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest height among the entries.
    pub fn max_height(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.height).max()
    }

    /// Entries stored in the given block file.
    pub fn entries_in(&self, file_id: u32) -> impl Iterator<Item = &IndexCacheEntry> {
        self.entries.iter().filter(move |e| e.file_id == file_id)
    }

    /// Overwrite the scan progress, as a flush does.
    pub fn apply(&mut self, state: &ScanState) {
        self.cursor = state.cursor;
        self.tip = state.tip;
        self.files = state.files.clone();
        self.orphans = state.orphans.clone();
    }

    /// Forget the orphans matching `drop` and rewind the cursor to the
    /// earliest of them. Returns how many were dropped.
    pub fn drop_orphans(&mut self, mut drop: impl FnMut(&BlockRecord) -> bool) -> usize {
        let before = self.orphans.len();
        let mut earliest: Option<ScanCursor> = None;
        self.orphans.retain(|record| {
            if !drop(record) {
                return true;
            }
            let pos = record.position();
            earliest = Some(earliest.map_or(pos, |cur| cur.min(pos)));
            false
        });
        if let Some(pos) = earliest {
            self.cursor.rewind_to(pos);
        }
        before - self.orphans.len()
    }

    /// Drop every entry at or above `height` and rewind the cursor to the
    /// earliest dropped position, so the dropped region gets scanned again.
    ///
    /// Returns the number of dropped entries.
    pub fn truncate(&mut self, height: u32) -> usize {
        let before = self.entries.len();
        let mut earliest: Option<ScanCursor> = None;
        self.entries.retain(|e| {
            if e.height < height {
                return true;
            }
            let pos = e.position();
            earliest = Some(earliest.map_or(pos, |cur| cur.min(pos)));
            false
        });
        if let Some(pos) = earliest {
            self.cursor.rewind_to(pos);
        }
        if let Some(tip) = self.tip {
            if !self.entries.iter().any(|e| e.hash == tip) {
                self.tip = None;
            }
        }
        before - self.entries.len()
    }
}

/// Persistence backend for the index cache.
///
/// Implementations: `MemoryIndexStore` and `SqliteIndexStore` in
/// `blockiter-storage`.
pub trait IndexStore {
    /// Reconstruct all persisted state. A corrupt store is reported as
    /// [`IterError::CacheCorrupt`]; the caller then calls [`IndexStore::reset`].
    fn load(&mut self) -> Result<CacheSnapshot, IterError>;

    /// Queue a newly linked entry. Durable after [`IndexStore::flush`].
    fn append(&mut self, entry: IndexCacheEntry) -> Result<(), IterError>;

    /// Invalidate all entries at or above `height`, atomically with respect
    /// to a crash, with the semantics of [`CacheSnapshot::truncate`].
    fn truncate(&mut self, height: u32) -> Result<(), IterError>;

    /// Record the scan progress, replacing the stored orphans, then make
    /// every queued write durable.
    fn flush(&mut self, state: &ScanState) -> Result<(), IterError>;

    /// Discard everything (used when the store turned out to be corrupt).
    fn reset(&mut self) -> Result<(), IterError>;
}

/// Wraps an [`IndexStore`] with corruption fallback and bookkeeping.
pub struct IndexCache {
    store: Box<dyn IndexStore>,
    /// Entries queued since the last flush.
    pending: usize,
    /// Whether the last load produced any entries.
    reused: bool,
}

impl IndexCache {
    pub fn new(store: Box<dyn IndexStore>) -> Self {
        Self {
            store,
            pending: 0,
            reused: false,
        }
    }

    /// Load the persisted snapshot. Corruption is never surfaced: the store
    /// is reset and an empty snapshot returned.
    pub fn load(&mut self) -> Result<CacheSnapshot, IterError> {
        let snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(IterError::CacheCorrupt(reason)) => {
                tracing::warn!(%reason, "Index cache unreadable, falling back to full rescan");
                self.store.reset()?;
                CacheSnapshot::default()
            }
            Err(e) => return Err(e),
        };
        self.reused = !snapshot.is_empty();
        Ok(snapshot)
    }

    pub fn append(&mut self, entry: IndexCacheEntry) -> Result<(), IterError> {
        self.pending += 1;
        self.store.append(entry)
    }

    pub fn truncate(&mut self, height: u32) -> Result<(), IterError> {
        tracing::warn!(height, "Truncating index cache");
        self.store.truncate(height)
    }

    pub fn flush(&mut self, state: &ScanState) -> Result<(), IterError> {
        self.store.flush(state)?;
        tracing::debug!(
            entries = self.pending,
            orphans = state.orphans.len(),
            cursor = %state.cursor,
            "Index cache flushed"
        );
        self.pending = 0;
        Ok(())
    }

    /// Discard everything persisted so far.
    pub fn reset(&mut self) -> Result<(), IterError> {
        self.pending = 0;
        self.reused = false;
        self.store.reset()
    }

    /// Whether the last [`IndexCache::load`] found usable entries.
    pub fn reused(&self) -> bool {
        self.reused
    }

    /// Entries appended since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }
}
