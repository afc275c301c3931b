//! End-to-end iteration tests.
//!
//! Each test writes synthetic `blkNNNNN.dat` files into a scratch directory,
//! runs the iterator against them (usually twice, to exercise the index
//! cache), and checks what the callback saw.

use std::path::Path;
use std::time::Duration;

use blockiter_bitcoin::{iterate, iterate_with, IterateBuilder, IterateSummary};
use blockiter_core::chain::ChainAssembler;
use blockiter_core::index::IndexStore;
use blockiter_core::types::{BlockHeader, HEADER_SIZE};
use blockiter_core::{Block, BlockHandler, BlockHash, Flow, HeaderView, IterError, IterateConfig, Network};
use blockiter_storage::SqliteIndexStore;
use tempfile::TempDir;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn header(prev: BlockHash, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 0x2000_0000,
        prev_hash: prev,
        merkle_root: BlockHash::from_bytes([nonce as u8; 32]),
        timestamp: 1_600_000_000 + nonce,
        bits: 0x207f_ffff,
        nonce,
    }
}

/// `n` linked headers on top of `parent`; nonces start at `salt`.
fn chain_from(parent: BlockHash, n: usize, salt: u32) -> Vec<BlockHeader> {
    let mut prev = parent;
    (0..n)
        .map(|i| {
            let h = header(prev, salt + i as u32);
            prev = h.hash();
            h
        })
        .collect()
}

fn hashes(headers: &[BlockHeader]) -> Vec<BlockHash> {
    headers.iter().map(BlockHeader::hash).collect()
}

/// Transactions stand-in: a few bytes derived from the nonce.
fn tx_bytes(h: &BlockHeader) -> Vec<u8> {
    let mut tx = h.nonce.to_le_bytes().to_vec();
    tx.extend_from_slice(&[0xee; 3]);
    tx
}

/// One coinbase transaction paying `amount` to `OP_TRUE`, preceded by the
/// transaction count.
fn coinbase_txs(amount: u64) -> Vec<u8> {
    let mut tx = vec![1];
    tx.extend_from_slice(&1u32.to_le_bytes());
    tx.push(1);
    tx.extend_from_slice(&[0; 32]);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.extend_from_slice(&[2, 0x51, 0x00]);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.push(1);
    tx.extend_from_slice(&amount.to_le_bytes());
    tx.extend_from_slice(&[1, 0x51]);
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

fn record(magic: u32, h: &BlockHeader) -> Vec<u8> {
    record_with(magic, h, &tx_bytes(h))
}

fn record_with(magic: u32, h: &BlockHeader, tx: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&((HEADER_SIZE + tx.len()) as u32).to_le_bytes());
    out.extend_from_slice(&h.encode());
    out.extend_from_slice(tx);
    out
}

fn records(magic: u32, headers: &[BlockHeader]) -> Vec<u8> {
    headers.iter().flat_map(|h| record(magic, h)).collect()
}

/// A block directory and a cache directory, both scratch.
struct Fixture {
    blocks: TempDir,
    cache: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            blocks: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
        }
    }

    fn blocks(&self) -> &Path {
        self.blocks.path()
    }

    fn cache(&self) -> &Path {
        self.cache.path()
    }

    fn write_raw(&self, id: u32, bytes: &[u8]) {
        std::fs::write(self.blocks().join(format!("blk{id:05}.dat")), bytes).unwrap();
    }

    fn write(&self, id: u32, headers: &[BlockHeader]) {
        self.write_raw(id, &records(Network::Mainnet.magic(), headers));
    }

    /// Move a block file's mtime forward, as a later write by the node would.
    fn bump_mtime(&self, id: u32) {
        let path = self.blocks().join(format!("blk{id:05}.dat"));
        let file = std::fs::File::options().write(true).open(path).unwrap();
        let modified = file.metadata().unwrap().modified().unwrap();
        file.set_modified(modified + Duration::from_secs(5)).unwrap();
    }

    /// Run `iterate` and collect `(height, hash)` for each visited block.
    fn collect(&self, end: Option<u32>) -> Result<(Vec<(u32, BlockHash)>, IterateSummary), IterError> {
        let mut seen = Vec::new();
        let summary = iterate(self.blocks(), self.cache(), end, |block, header| {
            assert_eq!(block.hash, header.hash);
            assert_eq!(block.height, header.height);
            seen.push((header.height, block.hash));
            Ok::<_, IterError>(Flow::Continue)
        })?;
        Ok((seen, summary))
    }

    /// What a run with an empty cache sees.
    fn collect_fresh(&self) -> Vec<(u32, BlockHash)> {
        let scratch = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        iterate(self.blocks(), scratch.path(), None, |block, _| {
            seen.push((block.height, block.hash));
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
        seen
    }

    fn config(&self) -> IterateConfig {
        IterateConfig {
            cachedir: Some(self.cache().to_path_buf()),
            ..IterateConfig::new(self.blocks())
        }
    }
}

fn heights(seen: &[(u32, BlockHash)]) -> Vec<u32> {
    seen.iter().map(|(h, _)| *h).collect()
}

fn visited(seen: &[(u32, BlockHash)]) -> Vec<BlockHash> {
    seen.iter().map(|(_, hash)| *hash).collect()
}

// ─── Basic iteration ──────────────────────────────────────────────────────────

#[test]
fn three_blocks_end_one_yields_heights_zero_and_one() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 3, 0));

    let (seen, _) = fx.collect(Some(1)).unwrap();
    assert_eq!(heights(&seen), vec![0, 1]);
}

#[test]
fn end_height_yields_exactly_h_plus_one_blocks() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 10, 0);
    fx.write(0, &chain);

    let (seen, summary) = fx.collect(Some(6)).unwrap();
    assert_eq!(heights(&seen), (0..=6).collect::<Vec<_>>());
    assert_eq!(visited(&seen), hashes(&chain[..7]));
    assert_eq!(summary.blocks, 7);
    assert_eq!(summary.first_height, Some(0));
    assert_eq!(summary.last_height, Some(6));
    assert_eq!(summary.tip_height, Some(9));
}

#[test]
fn no_end_iterates_to_tip() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 5, 0);
    fx.write(0, &chain[..2]);
    fx.write(1, &chain[2..]);

    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert!(!summary.stopped);
}

#[test]
fn callback_sees_payload_and_header_view() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 2, 40);
    fx.write(0, &chain);

    let mut checked = 0;
    iterate(fx.blocks(), fx.cache(), None, |block, header| {
        let expected = &chain[header.height as usize];
        assert_eq!(header.header, *expected);
        assert_eq!(header.length as usize, HEADER_SIZE + tx_bytes(expected).len());
        assert_eq!(block.payload.len(), header.length as usize);
        assert_eq!(&block.payload[..HEADER_SIZE], &expected.encode()[..]);
        assert_eq!(block.transactions_bytes(), tx_bytes(expected).as_slice());
        checked += 1;
        Ok::<_, IterError>(Flow::Continue)
    })
    .unwrap();
    assert_eq!(checked, 2);
}

#[test]
fn payload_loading_can_be_disabled() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 3, 0));

    let summary = IterateBuilder::new(fx.blocks())
        .load_payload(false)
        .run(|block, header| {
            assert!(block.payload.is_empty());
            assert!(header.length > 0);
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
    assert_eq!(summary.blocks, 3);
}

#[test]
fn out_of_order_records_are_linked() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    let shuffled = [chain[2], chain[0], chain[3], chain[1]];
    fx.write(0, &shuffled);

    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
}

#[test]
fn orphans_are_skipped() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 3, 0);
    let orphan = header(BlockHash::from_bytes([0x77; 32]), 900);
    fx.write(0, &[chain[0], orphan, chain[1], chain[2]]);

    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));

    // the orphan is cached, so a rerun agrees without reading anything
    let (again, summary) = fx.collect(None).unwrap();
    assert_eq!(again, seen);
    assert_eq!(summary.records_scanned, 0);

    let snapshot = SqliteIndexStore::open(fx.cache(), Network::Mainnet)
        .unwrap()
        .load()
        .unwrap();
    let cached: Vec<_> = snapshot.orphans.iter().map(|o| o.hash).collect();
    assert_eq!(cached, vec![orphan.hash()]);
}

#[test]
fn cached_orphan_links_when_its_parent_arrives() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 3, 0);
    fx.write(0, &[chain[0], chain[2]]);
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(heights(&seen), vec![0]);

    fx.write(1, &chain[1..2]);
    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert_eq!(summary.records_scanned, 1);

    let (again, summary) = fx.collect(None).unwrap();
    assert_eq!(again, seen);
    assert_eq!(summary.records_scanned, 0);
}

#[test]
fn zero_padding_between_records() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 3, 0);
    let magic = Network::Mainnet.magic();
    let mut bytes = record(magic, &chain[0]);
    bytes.extend_from_slice(&[0; 32]);
    bytes.extend(record(magic, &chain[1]));
    bytes.extend_from_slice(&[0; 7]);
    bytes.extend(record(magic, &chain[2]));
    bytes.extend_from_slice(&[0; 4096]);
    fx.write_raw(0, &bytes);

    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
}

#[test]
fn testnet_magic() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 3, 0);
    fx.write_raw(0, &records(Network::Testnet.magic(), &chain));

    let config = IterateConfig {
        network: Network::Testnet,
        ..fx.config()
    };
    let mut seen = Vec::new();
    iterate_with(&config, |block: &blockiter_core::Block, _: &blockiter_core::HeaderView| {
        seen.push(block.hash);
        Ok::<_, IterError>(Flow::Continue)
    })
    .unwrap();
    assert_eq!(seen, hashes(&chain));

    // mainnet finds no records in a testnet file
    let summary = IterateBuilder::new(fx.blocks())
        .run(|_, _| Ok::<_, IterError>(Flow::Continue))
        .unwrap();
    assert_eq!(summary.blocks, 0);
}

#[test]
fn empty_directory() {
    let fx = Fixture::new();

    let (seen, summary) = fx.collect(None).unwrap();
    assert!(seen.is_empty());
    assert_eq!(summary.tip_height, None);

    match fx.collect(Some(0)) {
        Err(IterError::HeightUnreachable { requested: 0, tip: None }) => {}
        other => panic!("expected HeightUnreachable, got {other:?}"),
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[test]
fn end_beyond_tip_is_unreachable_after_full_scan() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 3, 0));

    let mut calls = 0;
    let err = iterate(fx.blocks(), fx.cache(), Some(10), |_, _| {
        calls += 1;
        Ok::<_, IterError>(Flow::Continue)
    })
    .unwrap_err();
    assert!(matches!(
        err,
        IterError::HeightUnreachable {
            requested: 10,
            tip: Some(2)
        }
    ));
    assert_eq!(calls, 0);

    // the scan was still persisted
    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(seen.len(), 3);
    assert!(summary.cache_reused);
    assert_eq!(summary.records_scanned, 0);
}

#[test]
fn missing_block_directory() {
    let fx = Fixture::new();
    let missing = fx.blocks().join("does-not-exist");
    let err = iterate(&missing, fx.cache(), None, |_, _| Ok::<_, IterError>(Flow::Continue))
        .unwrap_err();
    assert!(matches!(err, IterError::MissingDirectory { .. }));
}

#[test]
fn duplicate_block_file_names() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 2, 0);
    fx.write(1, &chain);
    std::fs::write(fx.blocks().join("blk1.dat"), records(Network::Mainnet.magic(), &chain)).unwrap();

    let err = fx.collect(None).unwrap_err();
    assert!(matches!(err, IterError::DuplicateBlockFile { file_id: 1, .. }));
}

#[derive(Debug)]
enum AppError {
    Iter(IterError),
    Rejected(u32),
}

impl From<IterError> for AppError {
    fn from(e: IterError) -> Self {
        Self::Iter(e)
    }
}

#[test]
fn callback_error_propagates_and_cache_stays_valid() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 5, 0);
    fx.write(0, &chain);

    let result = iterate(fx.blocks(), fx.cache(), None, |_, header| {
        if header.height == 1 {
            return Err(AppError::Rejected(header.height));
        }
        Ok(Flow::Continue)
    });
    assert!(matches!(result, Err(AppError::Rejected(1))));

    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert!(summary.cache_reused);
    assert_eq!(summary.records_scanned, 0);
}

#[test]
fn iterator_errors_convert_into_caller_error() {
    let fx = Fixture::new();
    let missing = fx.blocks().join("nope");
    let result = iterate(&missing, fx.cache(), None, |_, _| Ok::<_, AppError>(Flow::Continue));
    assert!(matches!(
        result,
        Err(AppError::Iter(IterError::MissingDirectory { .. }))
    ));
}

#[test]
fn stop_ends_iteration() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 6, 0));

    let mut seen = Vec::new();
    let summary = iterate(fx.blocks(), fx.cache(), None, |_, header| {
        seen.push(header.height);
        Ok::<_, IterError>(if header.height == 2 { Flow::Stop } else { Flow::Continue })
    })
    .unwrap();
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(summary.stopped);
    assert_eq!(summary.last_height, Some(2));
}

// ─── Index cache ──────────────────────────────────────────────────────────────

#[test]
fn second_run_reuses_cache_and_matches() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 8, 0);
    fx.write(0, &chain[..5]);
    fx.write(1, &chain[5..]);

    let (first, summary) = fx.collect(None).unwrap();
    assert!(!summary.cache_reused);
    assert_eq!(summary.records_scanned, 8);

    let (second, summary) = fx.collect(None).unwrap();
    assert_eq!(second, first);
    assert!(summary.cache_reused);
    assert_eq!(summary.records_scanned, 0);
}

#[test]
fn appended_blocks_are_picked_up() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 6, 0);
    fx.write(0, &chain[..3]);
    fx.collect(None).unwrap();

    fx.write(0, &chain);
    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert_eq!(summary.records_scanned, 3);
}

#[test]
fn cache_reload_reconstructs_best_chain() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    let side = chain_from(chain[1].hash(), 1, 500);
    fx.write(0, &chain);
    fx.write(1, &side);
    fx.collect(None).unwrap();

    let mut store = SqliteIndexStore::open(fx.cache(), Network::Mainnet).unwrap();
    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.entries.len(), 5, "side branches are cached too");
    assert_eq!(snapshot.tip, Some(chain[3].hash()));

    let mut assembler = ChainAssembler::new();
    assembler.seed(&snapshot.entries, snapshot.tip).unwrap();
    assert_eq!(assembler.best_chain().as_slice(), hashes(&chain).as_slice());
}

#[test]
fn reorg_replaces_cached_branch() {
    let fx = Fixture::new();
    let main = chain_from(BlockHash::ZERO, 4, 0);
    fx.write(0, &main);
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&main));

    // a longer branch forking after genesis arrives in the next file
    let fork = chain_from(main[0].hash(), 4, 100);
    fx.write(1, &fork);
    let (seen, summary) = fx.collect(None).unwrap();
    let mut expected = vec![main[0].hash()];
    expected.extend(hashes(&fork));
    assert_eq!(visited(&seen), expected);
    assert_eq!(summary.reorgs, 1);
    assert_eq!(summary.tip_height, Some(4));

    // the rewritten cache agrees without rescanning
    let (again, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&again), expected);
    assert_eq!(summary.records_scanned, 0);
    assert_eq!(summary.reorgs, 0);
}

#[test]
fn corrupt_tail_is_tolerated_and_resumed() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    let magic = Network::Mainnet.magic();
    let mut bytes = records(magic, &chain[..3]);
    let last = record(magic, &chain[3]);
    bytes.extend_from_slice(&last[..last.len() / 2]);
    fx.write_raw(0, &bytes);

    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain[..3]));

    // the writer finishes the record; the next run resumes at it
    fx.write(0, &chain);
    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert_eq!(summary.records_scanned, 1);
}

#[test]
fn rewritten_block_file_invalidates_cache() {
    let fx = Fixture::new();
    let old = chain_from(BlockHash::ZERO, 3, 0);
    fx.write(0, &old);
    fx.collect(None).unwrap();

    let new = chain_from(BlockHash::ZERO, 3, 1000);
    fx.write(0, &new);
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&new));
}

#[test]
fn rewrite_inside_a_file_matches_a_fresh_scan() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 5, 0);
    fx.write(0, &chain);
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(heights(&seen), vec![0, 1, 2, 3, 4]);

    // same length, with the third record replaced by an unrelated block
    let stray = header(BlockHash::from_bytes([0x33; 32]), 2);
    fx.write(0, &[chain[0], chain[1], stray, chain[3], chain[4]]);
    fx.bump_mtime(0);

    let (cached, _) = fx.collect(None).unwrap();
    assert_eq!(heights(&cached), vec![0, 1]);
    assert_eq!(cached, fx.collect_fresh());

    let (again, summary) = fx.collect(None).unwrap();
    assert_eq!(again, cached);
    assert_eq!(summary.records_scanned, 0);
}

#[test]
fn completed_tail_in_an_earlier_file_is_picked_up() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    let magic = Network::Mainnet.magic();
    let mut bytes = records(magic, &chain[..2]);
    let partial = record(magic, &chain[2]);
    bytes.extend_from_slice(&partial[..partial.len() / 2]);
    fx.write_raw(0, &bytes);
    fx.write(1, &chain[3..]);

    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(heights(&seen), vec![0, 1]);

    // the writer finishes blk00000 after blk00001 was scanned
    fx.write(0, &chain[..3]);
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(heights(&seen), vec![0, 1, 2, 3]);
    assert_eq!(visited(&seen), hashes(&chain));
    assert_eq!(seen, fx.collect_fresh());
}

#[test]
fn removed_block_file_invalidates_cache() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    fx.write(0, &chain[..2]);
    fx.write(1, &chain[2..]);
    fx.collect(None).unwrap();

    std::fs::remove_file(fx.blocks().join("blk00001.dat")).unwrap();
    let (seen, _) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain[..2]));
}

#[test]
fn corrupt_cache_falls_back_to_rescan() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 3, 0);
    fx.write(0, &chain);
    fx.collect(None).unwrap();

    for name in ["index.sqlite-wal", "index.sqlite-shm"] {
        let _ = std::fs::remove_file(fx.cache().join(name));
    }
    std::fs::write(fx.cache().join("index.sqlite"), vec![0xa5; 8192]).unwrap();

    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert!(!summary.cache_reused);
    assert_eq!(summary.records_scanned, 3);
}

#[test]
fn cache_directory_is_created() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 2, 0));
    let nested = fx.cache().join("a").join("b");

    iterate(fx.blocks(), &nested, None, |_, _| Ok::<_, IterError>(Flow::Continue)).unwrap();
    assert!(nested.join("index.sqlite").exists());
}

#[test]
fn scan_stops_past_end_plus_margin() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 20, 0);
    fx.write(0, &chain);

    let summary = IterateBuilder::from_config(fx.config())
        .end_height(5)
        .reorg_margin(3)
        .run(|_, _| Ok::<_, IterError>(Flow::Continue))
        .unwrap();
    assert_eq!(summary.blocks, 6);
    assert_eq!(summary.records_scanned, 9);

    let (seen, summary) = fx.collect(None).unwrap();
    assert_eq!(visited(&seen), hashes(&chain));
    assert_eq!(summary.records_scanned, 11);
}

// ─── Start / end selection ────────────────────────────────────────────────────

#[test]
fn start_height_skips_lower_blocks() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 6, 0);
    fx.write(0, &chain);

    let mut seen = Vec::new();
    IterateBuilder::from_config(fx.config())
        .start_height(3)
        .end_height(4)
        .run(|_, header| {
            seen.push(header.height);
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
    assert_eq!(seen, vec![3, 4]);
}

#[test]
fn start_and_end_hash_select_a_branch() {
    let fx = Fixture::new();
    let main = chain_from(BlockHash::ZERO, 4, 0);
    let side = chain_from(main[1].hash(), 1, 300);
    fx.write(0, &main);
    fx.write(1, &side);

    // walk the side branch instead of the best chain
    let mut seen = Vec::new();
    IterateBuilder::from_config(fx.config())
        .end_hash(side[0].hash())
        .run(|block, _| {
            seen.push(block.hash);
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
    assert_eq!(seen, vec![main[0].hash(), main[1].hash(), side[0].hash()]);

    let mut seen = Vec::new();
    IterateBuilder::from_config(fx.config())
        .start_hash(main[2].hash())
        .run(|block, _| {
            seen.push(block.hash);
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
    assert_eq!(seen, vec![main[2].hash(), main[3].hash()]);
}

#[test]
fn unknown_hashes_are_rejected() {
    let fx = Fixture::new();
    fx.write(0, &chain_from(BlockHash::ZERO, 3, 0));
    let unknown = BlockHash::from_bytes([0x42; 32]);

    let err = IterateBuilder::from_config(fx.config())
        .start_hash(unknown)
        .run(|_, _| Ok::<_, IterError>(Flow::Continue))
        .unwrap_err();
    assert!(matches!(err, IterError::UnknownBlock(h) if h == unknown));

    let err = IterateBuilder::from_config(fx.config())
        .end_hash(unknown)
        .run(|_, _| Ok::<_, IterError>(Flow::Continue))
        .unwrap_err();
    assert!(matches!(err, IterError::UnknownBlock(_)));
}

#[test]
fn lazy_block_iterator() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 5, 0);
    fx.write(0, &chain);

    let mut iter = IterateBuilder::from_config(fx.config())
        .end_height(3)
        .prepare()
        .unwrap();
    assert_eq!(iter.range(), Some((0, 3)));
    assert_eq!(iter.tip_height(), Some(4));

    let hashes_seen: Vec<_> = iter
        .blocks()
        .map(|item| item.map(|(block, _)| block.hash))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(hashes_seen, hashes(&chain[..4]));
}

#[test]
fn transactions_decode_during_iteration() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 2, 0);
    let magic = Network::Mainnet.magic();
    let mut bytes = record_with(magic, &chain[0], &coinbase_txs(5_000_000_000));
    bytes.extend(record_with(magic, &chain[1], &coinbase_txs(2_500_000_000)));
    fx.write_raw(0, &bytes);

    let mut paid = Vec::new();
    iterate(fx.blocks(), fx.cache(), None, |block, header| {
        assert_eq!(header.transaction_count, Some(1));
        let txs = block.transactions()?;
        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_coinbase());
        assert!(!txs[0].segwit);
        paid.push(txs[0].output_total());
        Ok::<_, IterError>(Flow::Continue)
    })
    .unwrap();
    assert_eq!(paid, vec![5_000_000_000, 2_500_000_000]);

    // without payloads the count is still read from the block file
    let summary = IterateBuilder::from_config(fx.config())
        .load_payload(false)
        .run(|block, header| {
            assert!(block.payload.is_empty());
            assert_eq!(header.transaction_count, Some(1));
            Ok::<_, IterError>(Flow::Continue)
        })
        .unwrap();
    assert_eq!(summary.blocks, 2);
}

/// Counts transaction bytes and stops once `limit` blocks were seen.
struct TxCounter<'a> {
    limit: u32,
    tx_bytes: &'a mut usize,
}

impl BlockHandler for TxCounter<'_> {
    type Error = IterError;

    fn handle_block(&mut self, block: &Block, header: &HeaderView) -> Result<Flow, IterError> {
        *self.tx_bytes += block.transactions_bytes().len();
        if header.height + 1 >= self.limit {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}

#[test]
fn struct_handler_via_builder() {
    let fx = Fixture::new();
    let chain = chain_from(BlockHash::ZERO, 4, 0);
    fx.write(0, &chain);

    let mut total = 0;
    let summary = IterateBuilder::from_config(fx.config())
        .run_handler(TxCounter {
            limit: 2,
            tx_bytes: &mut total,
        })
        .unwrap();

    assert!(summary.stopped);
    assert_eq!(summary.blocks, 2);
    assert_eq!(total, tx_bytes(&chain[0]).len() + tx_bytes(&chain[1]).len());
}
