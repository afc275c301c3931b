//! The height iterator — loads the index cache, scans, and replays blocks.
//!
//! # Phase 1: LOAD
//! Open the index cache and check it against the block files. A file whose
//! length and mtime match its fingerprint gets a spot check of its first and
//! last cached records; any other file has every cached record re-read. Entries
//! from the lowest mismatched height up are dropped, mismatched orphans are
//! forgotten, and the cursor moves back to where each changed file was last
//! cleanly scanned. The rest is replayed into a fresh [`ChainAssembler`].
//!
//! # Phase 2: SCAN
//! Read records from the cache's scan cursor onward, linking each one and
//! queueing newly linked entries. With an end height set, scanning stops once
//! the tip is `reorg_margin` blocks past it.
//!
//! # Phase 3: PERSIST
//! Rewrite the cache suffix if a reorg reached below the cached height, then
//! commit entries, cursor, tip, orphans and file fingerprints in one flush.
//!
//! # Phase 4: ITERATE
//! Walk the chain from the start height to the end height, handing each block
//! to the caller.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde::Serialize;

use blockiter_core::chain::{BestChain, ChainAssembler, Insert};
use blockiter_core::config::IterateConfig;
use blockiter_core::cursor::ScanCursor;
use blockiter_core::error::IterError;
use blockiter_core::handler::{BlockHandler, Flow};
use blockiter_core::index::{
    CacheSnapshot, FileFingerprint, IndexCache, IndexCacheEntry, IndexStore, ScanState,
};
use blockiter_core::types::{Block, BlockRecord, HeaderView};
use blockiter_storage::{MemoryIndexStore, SqliteIndexStore};

use crate::scanner::{BlockFiles, BlockReader, FileScanner};

/// What one `iterate` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterateSummary {
    /// Blocks handed to the callback.
    pub blocks: u64,
    pub first_height: Option<u32>,
    pub last_height: Option<u32>,
    /// Best tip after scanning.
    pub tip_height: Option<u32>,
    /// The callback returned [`Flow::Stop`].
    pub stopped: bool,
    /// The run started from a non-empty index cache.
    pub cache_reused: bool,
    /// Records read from block files during this run.
    pub records_scanned: u64,
    /// Best-chain switches seen while scanning.
    pub reorgs: usize,
}

/// Iterate `blockdir` from genesis to `end` (or the current tip), keeping the
/// index cache in `cachedir`.
///
/// Errors returned by `blockfn` reach the caller unmodified.
pub fn iterate<F, E>(
    blockdir: impl AsRef<Path>,
    cachedir: impl AsRef<Path>,
    end: Option<u32>,
    blockfn: F,
) -> Result<IterateSummary, E>
where
    F: FnMut(&Block, &HeaderView) -> Result<Flow, E>,
    E: From<IterError>,
{
    let config = IterateConfig {
        cachedir: Some(cachedir.as_ref().to_path_buf()),
        end_height: end,
        ..IterateConfig::new(blockdir.as_ref())
    };
    iterate_with(&config, blockfn)
}

/// Like [`iterate`], with every option available.
pub fn iterate_with<H>(config: &IterateConfig, mut handler: H) -> Result<IterateSummary, H::Error>
where
    H: BlockHandler,
    H::Error: From<IterError>,
{
    let mut iter = HeightIterator::prepare(config)?;
    iter.run(&mut handler)
}

/// A scanned, persisted chain ready to be walked by height.
pub struct HeightIterator {
    config: IterateConfig,
    assembler: ChainAssembler,
    reader: BlockReader,
    /// The chain being walked: the best chain, or the branch to `end_hash`.
    chain: BestChain,
    /// Inclusive height range; `None` when there is nothing to visit.
    range: Option<(u32, u32)>,
    cache_reused: bool,
    records_scanned: u64,
    reorgs: usize,
}

impl HeightIterator {
    /// Run the load, scan and persist phases and resolve the height range.
    ///
    /// The cache is flushed before this returns, including when the requested
    /// range turns out to be unreachable.
    pub fn prepare(config: &IterateConfig) -> Result<Self, IterError> {
        config.validate()?;
        let files = BlockFiles::discover(&config.blockdir)?;
        let mut reader = BlockReader::new(&files, config.network.magic());

        let store: Box<dyn IndexStore> = match &config.cachedir {
            Some(dir) => Box::new(SqliteIndexStore::open(dir, config.network)?),
            None => Box::new(MemoryIndexStore::new()),
        };
        let mut cache = IndexCache::new(store);

        // ── Phase 1: load ──────────────────────────────────────────────────
        let mut snapshot = cache.load()?;
        if let Some(height) = stale_height(&mut snapshot, &files, &mut reader)? {
            cache.truncate(height)?;
            snapshot.truncate(height);
        }
        rewind_for_changed_files(&mut snapshot, &files);
        // orphans past the cursor are found again by the scan
        let cursor = snapshot.cursor;
        snapshot.orphans.retain(|orphan| orphan.position() < cursor);

        let mut assembler = ChainAssembler::new();
        if let Err(e) = assembler.seed(&snapshot.entries, snapshot.tip) {
            tracing::warn!(error = %e, "Index cache inconsistent, falling back to full rescan");
            cache.reset()?;
            assembler = ChainAssembler::new();
            snapshot = CacheSnapshot::default();
        }
        for orphan in &snapshot.orphans {
            if let Insert::Linked(ids) = assembler.insert(orphan.clone()) {
                for id in ids {
                    append(&mut cache, assembler.entry(id))?;
                }
            }
        }
        let cache_reused = !snapshot.is_empty();
        if cache_reused {
            tracing::info!(
                entries = snapshot.entries.len(),
                orphans = snapshot.orphans.len(),
                cursor = %snapshot.cursor,
                tip_height = ?assembler.tip_height(),
                "Resuming from index cache"
            );
        }

        // ── Phase 2: scan ──────────────────────────────────────────────────
        let scan = scan(config, &files, &mut assembler, &mut cache, snapshot.cursor)?;

        // ── Phase 3: persist ───────────────────────────────────────────────
        let reorgs = assembler.drain_reorgs();
        let cache_fork = reorgs
            .iter()
            .filter(|event| event.affects_cache())
            .map(|event| event.fork_height)
            .min();
        if let Some(fork) = cache_fork {
            cache.truncate(fork)?;
            for id in assembler.linked_from(fork) {
                append(&mut cache, assembler.entry(id))?;
            }
        }
        cache.flush(&ScanState {
            cursor: scan.end,
            tip: assembler.best_chain().tip(),
            files: fingerprints(&files, &snapshot.files, &scan.scanned),
            orphans: assembler.unresolved(),
        })?;
        assembler.mark_persisted();

        // ── Resolve the range ──────────────────────────────────────────────
        let chain = match config.end_hash {
            Some(hash) => assembler.branch_to(hash)?,
            None => assembler.best_chain().clone(),
        };
        let range = resolve_range(config, &assembler, &chain)?;

        tracing::info!(
            records = scan.records,
            tip_height = ?assembler.tip_height(),
            orphans = assembler.unresolved_count(),
            reorgs = reorgs.len(),
            range = ?range,
            "Chain assembled"
        );

        Ok(Self {
            config: config.clone(),
            assembler,
            reader,
            chain,
            range,
            cache_reused,
            records_scanned: scan.records,
            reorgs: reorgs.len(),
        })
    }

    /// The chain being walked.
    pub fn chain(&self) -> &BestChain {
        &self.chain
    }

    pub fn assembler(&self) -> &ChainAssembler {
        &self.assembler
    }

    /// Inclusive `(start, end)` heights, or `None` if there is nothing to visit.
    pub fn range(&self) -> Option<(u32, u32)> {
        self.range
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.assembler.tip_height()
    }

    pub fn cache_reused(&self) -> bool {
        self.cache_reused
    }

    /// Blocks in ascending height order, read lazily.
    pub fn blocks(&mut self) -> Blocks<'_> {
        let (next, end) = match self.range {
            Some((start, end)) => (start, Some(end)),
            None => (0, None),
        };
        Blocks {
            owner: self,
            next,
            end,
        }
    }

    /// Hand every block in range to `handler`.
    pub fn run<H>(&mut self, handler: &mut H) -> Result<IterateSummary, H::Error>
    where
        H: BlockHandler,
        H::Error: From<IterError>,
    {
        let mut summary = IterateSummary {
            tip_height: self.assembler.tip_height(),
            cache_reused: self.cache_reused,
            records_scanned: self.records_scanned,
            reorgs: self.reorgs,
            ..IterateSummary::default()
        };
        let interval = u64::from(self.config.progress_interval);

        for item in self.blocks() {
            let (block, header) = item?;
            summary.first_height.get_or_insert(block.height);
            summary.last_height = Some(block.height);
            summary.blocks += 1;
            if interval > 0 && summary.blocks % interval == 0 {
                tracing::info!(height = block.height, blocks = summary.blocks, "Iterating");
            }
            if handler.handle_block(&block, &header)?.is_stop() {
                summary.stopped = true;
                break;
            }
        }

        tracing::info!(
            blocks = summary.blocks,
            first = ?summary.first_height,
            last = ?summary.last_height,
            stopped = summary.stopped,
            "Iteration finished"
        );
        Ok(summary)
    }

    fn load(&mut self, height: u32) -> Result<(Block, HeaderView), IterError> {
        let hash = self
            .chain
            .hash_at(height)
            .ok_or_else(|| IterError::HeightUnreachable {
                requested: height,
                tip: self.chain.tip_height(),
            })?;
        let record = &self
            .assembler
            .get(&hash)
            .ok_or(IterError::UnknownBlock(hash))?
            .record;
        let payload = if self.config.load_payload {
            self.reader.payload(record)?
        } else {
            Vec::new()
        };
        let block = Block {
            height,
            hash,
            header: record.header,
            file_id: record.file_id,
            offset: record.offset,
            payload,
        };
        let count = if self.config.load_payload {
            block.transaction_count()
        } else {
            self.reader.transaction_count(record)?
        };
        let header = HeaderView::from_record(record, height).with_transaction_count(count);
        Ok((block, header))
    }
}

/// Lazy walk over a [`HeightIterator`]'s range. Ends after the first error.
pub struct Blocks<'a> {
    owner: &'a mut HeightIterator,
    next: u32,
    end: Option<u32>,
}

impl Iterator for Blocks<'_> {
    type Item = Result<(Block, HeaderView), IterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.end?;
        if self.next > end {
            return None;
        }
        let height = self.next;
        match height.checked_add(1) {
            Some(next) => self.next = next,
            None => self.end = None,
        }
        let item = self.owner.load(height);
        if item.is_err() {
            self.end = None;
        }
        Some(item)
    }
}

// ─── Scan ─────────────────────────────────────────────────────────────────────

struct ScanOutcome {
    records: u64,
    /// Where the scan stopped: end of the last record read, a corrupt tail,
    /// or the early-stop point.
    end: ScanCursor,
    /// File id → clean scan end, for each file opened.
    scanned: BTreeMap<u32, u64>,
}

fn scan(
    config: &IterateConfig,
    files: &BlockFiles,
    assembler: &mut ChainAssembler,
    cache: &mut IndexCache,
    from: ScanCursor,
) -> Result<ScanOutcome, IterError> {
    let magic = config.network.magic();
    let target = match config.end_hash {
        Some(_) => None,
        None => config.scan_target(),
    };
    let interval = u64::from(config.progress_interval);
    let mut records = 0u64;
    let mut end = from;
    let mut scanned = BTreeMap::new();

    if let (Some(target), Some(tip)) = (target, assembler.tip_height()) {
        if tip >= target {
            tracing::debug!(tip, target, "Cached tip is past the end height, nothing to scan");
            return Ok(ScanOutcome {
                records,
                end,
                scanned,
            });
        }
    }
    tracing::info!(from = %from, files = files.len(), target = ?target, "Scanning block files");

    for file in files.from_id(from.file_id) {
        let Some(offset) = from.resume_offset(file.id) else {
            continue;
        };
        let mut scanner = FileScanner::open(file, magic, offset)?;
        let mut in_file = 0u64;
        let mut reached = false;

        for item in scanner.by_ref() {
            match item {
                Ok(record) => {
                    in_file += 1;
                    if let Insert::Linked(ids) = assembler.insert(record) {
                        for id in ids {
                            append(cache, assembler.entry(id))?;
                        }
                    }
                }
                Err(IterError::CorruptRecord {
                    file_id,
                    offset,
                    reason,
                }) => {
                    tracing::warn!(file_id, offset, %reason, "Corrupt record, ending file");
                }
                Err(e) => return Err(e),
            }
            if interval > 0 && (records + in_file) % interval == 0 {
                tracing::info!(
                    records = records + in_file,
                    tip_height = ?assembler.tip_height(),
                    "Scanning"
                );
            }
            if let (Some(target), Some(tip)) = (target, assembler.tip_height()) {
                if tip >= target {
                    reached = true;
                    break;
                }
            }
        }

        records += in_file;
        end = ScanCursor::new(file.id, scanner.scanned_to());
        scanned.insert(file.id, scanner.scanned_to());
        tracing::info!(
            file_id = file.id,
            records = in_file,
            tip_height = ?assembler.tip_height(),
            "Scanned block file"
        );
        if reached {
            tracing::info!(at = %end, "Tip is past the end height, scan stopped early");
            break;
        }
    }

    Ok(ScanOutcome {
        records,
        end,
        scanned,
    })
}

fn append(cache: &mut IndexCache, entry: Option<IndexCacheEntry>) -> Result<(), IterError> {
    match entry {
        Some(entry) => cache.append(entry),
        None => Ok(()),
    }
}

// ─── Cache validation ─────────────────────────────────────────────────────────

/// Lowest cached height that no longer matches its block file.
///
/// Orphans that no longer match are dropped from `snapshot` here, which also
/// rewinds its cursor to them.
fn stale_height(
    snapshot: &mut CacheSnapshot,
    files: &BlockFiles,
    reader: &mut BlockReader,
) -> Result<Option<u32>, IterError> {
    let file_ids: BTreeSet<u32> = snapshot
        .entries
        .iter()
        .map(|e| e.file_id)
        .chain(snapshot.orphans.iter().map(|o| o.file_id))
        .collect();

    let mut stale: Option<u32> = None;
    for file_id in file_ids {
        let fingerprint = snapshot.files.get(&file_id).copied();
        let gone = match (files.get(file_id), fingerprint) {
            (None, _) => Some("block file is gone".to_string()),
            (Some(file), Some(fp)) if file.len < fp.len => {
                Some(format!("shrank from {} to {} bytes", fp.len, file.len))
            }
            _ => None,
        };

        let mismatched = match gone {
            Some(reason) => {
                let height = snapshot.entries_in(file_id).map(|e| e.height).min();
                let orphans = snapshot.drop_orphans(|o| o.file_id == file_id);
                tracing::warn!(file_id, height = ?height, orphans, %reason, "Dropping cached records");
                height
            }
            None => {
                let unchanged = match (files.get(file_id), fingerprint) {
                    (Some(file), Some(fp)) => fp.matches(file.len, file.modified),
                    _ => false,
                };
                let (height, orphans) = if unchanged {
                    (spot_check(snapshot, file_id, reader)?, 0)
                } else {
                    full_check(snapshot, file_id, reader)?
                };
                if height.is_some() || orphans > 0 {
                    tracing::warn!(
                        file_id,
                        height = ?height,
                        orphans,
                        "Cached records no longer on disk, dropping them"
                    );
                }
                height
            }
        };
        if let Some(height) = mismatched {
            stale = Some(stale.map_or(height, |h| h.min(height)));
        }
    }
    Ok(stale)
}

/// Re-read the first and last cached entries of an unchanged file. Returns
/// the file's lowest cached height if either moved.
fn spot_check(
    snapshot: &CacheSnapshot,
    file_id: u32,
    reader: &mut BlockReader,
) -> Result<Option<u32>, IterError> {
    let first = snapshot.entries_in(file_id).min_by_key(|e| e.offset);
    let last = snapshot.entries_in(file_id).max_by_key(|e| e.offset);
    for entry in first.into_iter().chain(last) {
        if !on_disk(reader, &entry.to_record())? {
            return Ok(snapshot.entries_in(file_id).map(|e| e.height).min());
        }
    }
    Ok(None)
}

/// Re-read every cached record of a changed file. Returns the lowest
/// mismatched entry height and the number of orphans dropped.
fn full_check(
    snapshot: &mut CacheSnapshot,
    file_id: u32,
    reader: &mut BlockReader,
) -> Result<(Option<u32>, usize), IterError> {
    let mut mismatched: Option<u32> = None;
    for entry in snapshot.entries_in(file_id) {
        if !on_disk(reader, &entry.to_record())? {
            mismatched = Some(mismatched.map_or(entry.height, |h| h.min(entry.height)));
        }
    }

    let mut moved = HashSet::new();
    for orphan in snapshot.orphans.iter().filter(|o| o.file_id == file_id) {
        if !on_disk(reader, orphan)? {
            moved.insert(orphan.hash);
        }
    }
    let dropped = if moved.is_empty() {
        0
    } else {
        snapshot.drop_orphans(|o| moved.contains(&o.hash))
    };
    Ok((mismatched, dropped))
}

fn on_disk(reader: &mut BlockReader, record: &BlockRecord) -> Result<bool, IterError> {
    match reader.record_at(record.file_id, record.offset) {
        Ok(found) => Ok(found.hash == record.hash && found.length == record.length),
        Err(IterError::CorruptRecord { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Move the cursor back over block files that appeared or changed below it:
/// a new or shrunk file is scanned again from the start, any other changed
/// file from where its last scan ended cleanly.
fn rewind_for_changed_files(snapshot: &mut CacheSnapshot, files: &BlockFiles) {
    let cursor = snapshot.cursor;
    for file in files.iter().filter(|f| f.id <= cursor.file_id) {
        let rewind = match snapshot.files.get(&file.id) {
            None => Some(0),
            Some(fp) if file.len < fp.len => Some(0),
            Some(fp) if !fp.matches(file.len, file.modified) => Some(fp.scanned_to),
            _ => None,
        };
        if let Some(offset) = rewind {
            let to = ScanCursor::new(file.id, offset);
            if to < snapshot.cursor {
                tracing::warn!(file_id = file.id, offset, "Block file changed, rescanning from here");
                snapshot.cursor.rewind_to(to);
            }
        }
    }
    if let Some(file) = files.get(cursor.file_id) {
        if file.len < cursor.offset {
            snapshot.cursor.rewind_to(ScanCursor::new(file.id, 0));
        }
    }
}

/// Fingerprints to persist: fresh ones for files scanned this run, the
/// previous ones for files left untouched.
fn fingerprints(
    files: &BlockFiles,
    previous: &BTreeMap<u32, FileFingerprint>,
    scanned: &BTreeMap<u32, u64>,
) -> BTreeMap<u32, FileFingerprint> {
    files
        .iter()
        .filter_map(|file| {
            let fp = match scanned.get(&file.id) {
                Some(&scanned_to) => file.fingerprint(scanned_to),
                None => *previous.get(&file.id)?,
            };
            Some((file.id, fp))
        })
        .collect()
}

fn resolve_range(
    config: &IterateConfig,
    assembler: &ChainAssembler,
    chain: &BestChain,
) -> Result<Option<(u32, u32)>, IterError> {
    let tip = chain.tip_height();
    let end = match config.end_height {
        Some(end) if tip.map_or(true, |tip| end > tip) => {
            return Err(IterError::HeightUnreachable {
                requested: end,
                tip,
            })
        }
        Some(end) => Some(end),
        None => tip,
    };
    let start = match config.start_hash {
        Some(hash) => match assembler.get(&hash).and_then(|node| node.height()) {
            Some(height) if chain.hash_at(height) == Some(hash) => height,
            _ => return Err(IterError::UnknownBlock(hash)),
        },
        None => config.start_height,
    };
    match end {
        Some(end) if start <= end => Ok(Some((start, end))),
        None if start == 0 => Ok(None),
        _ => Err(IterError::HeightUnreachable {
            requested: start,
            tip,
        }),
    }
}
