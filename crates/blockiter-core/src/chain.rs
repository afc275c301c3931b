//! Chain assembler — links scanned block records into a forest and maintains
//! the best chain.
//!
//! Records may arrive in any order. A record whose parent is not yet linked
//! waits under its parent's hash and is linked, together with its own waiting
//! descendants, as soon as the parent links. Nodes live in an arena and refer
//! to their parents by hash only.

use std::collections::HashMap;

use crate::error::IterError;
use crate::index::IndexCacheEntry;
use crate::reorg::{classify, ReorgEvent, ReorgType};
use crate::types::{BlockHash, BlockRecord};

/// Index of a node in the assembler's arena. Also its first-seen order.
pub type NodeId = usize;

/// A scanned record plus its resolved height.
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub record: BlockRecord,
    height: Option<u32>,
}

impl ChainNode {
    pub fn hash(&self) -> BlockHash {
        self.record.hash
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.record.parent_hash()
    }

    /// `None` until the node is connected to a genesis block.
    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn is_linked(&self) -> bool {
        self.height.is_some()
    }
}

/// Block hashes from genesis (index 0) to the tip, one per height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestChain {
    hashes: Vec<BlockHash>,
}

impl BestChain {
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn tip(&self) -> Option<BlockHash> {
        self.hashes.last().copied()
    }

    pub fn tip_height(&self) -> Option<u32> {
        (self.hashes.len() as u32).checked_sub(1)
    }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.hashes.get(height as usize).copied()
    }

    /// `(height, hash)` pairs in ascending height order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, BlockHash)> + '_ {
        self.hashes.iter().enumerate().map(|(h, hash)| (h as u32, *hash))
    }

    pub fn as_slice(&self) -> &[BlockHash] {
        &self.hashes
    }
}

/// Outcome of [`ChainAssembler::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    /// The record linked; contains it and every waiting descendant that
    /// linked with it, parents first.
    Linked(Vec<NodeId>),
    /// The parent is not linked yet; the record waits for it.
    Pending,
    /// Same hash already known at the same position (a rescan).
    Rescan,
    /// Same hash already known at another position; the first copy is kept.
    Duplicate,
}

/// Builds the block forest and tracks the best tip.
///
/// The best tip is the linked node with the greatest height; among equal
/// heights the first-seen node wins.
#[derive(Debug, Default)]
pub struct ChainAssembler {
    nodes: Vec<ChainNode>,
    by_hash: HashMap<BlockHash, NodeId>,
    /// Unlinked records keyed by the parent hash they wait for.
    waiting: HashMap<BlockHash, Vec<NodeId>>,
    best: BestChain,
    tip: Option<NodeId>,
    /// Best-chain heights already held by the index cache.
    persisted_len: u32,
    reorgs: Vec<ReorgEvent>,
}

impl ChainAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay cached entries (parents first) and restore the cached tip.
    ///
    /// Fails with [`IterError::CacheCorrupt`] if the entries do not form a
    /// consistent forest.
    pub fn seed(
        &mut self,
        entries: &[IndexCacheEntry],
        tip: Option<BlockHash>,
    ) -> Result<(), IterError> {
        for entry in entries {
            if entry.to_record().header.hash() != entry.hash {
                return Err(IterError::CacheCorrupt(format!(
                    "entry {} does not match its header",
                    entry.hash
                )));
            }
            self.insert(entry.to_record());
            let height = self.by_hash.get(&entry.hash).and_then(|&id| self.nodes[id].height);
            if height != Some(entry.height) {
                return Err(IterError::CacheCorrupt(format!(
                    "entry {} cached at height {} links at {:?}",
                    entry.hash, entry.height, height
                )));
            }
        }
        if let Some(tip) = tip {
            if let Some(&id) = self.by_hash.get(&tip) {
                self.force_tip(id);
            }
        }
        self.reorgs.clear();
        self.persisted_len = self.best.len() as u32;
        Ok(())
    }

    /// Add a scanned record, linking it and any descendants waiting on it.
    pub fn insert(&mut self, record: BlockRecord) -> Insert {
        if let Some(&known) = self.by_hash.get(&record.hash) {
            let existing = &self.nodes[known].record;
            if existing.position() == record.position() {
                return Insert::Rescan;
            }
            tracing::warn!(
                hash = %record.hash,
                first = %existing.position(),
                second = %record.position(),
                "Already have block, keeping first copy"
            );
            return Insert::Duplicate;
        }

        let id = self.nodes.len();
        let hash = record.hash;
        let parent = record.parent_hash();
        let height = if record.is_genesis() {
            Some(0)
        } else {
            self.by_hash
                .get(&parent)
                .and_then(|&p| self.nodes[p].height)
                .map(|h| h + 1)
        };
        self.nodes.push(ChainNode {
            record,
            height: None,
        });
        self.by_hash.insert(hash, id);

        match height {
            Some(h) => Insert::Linked(self.link(id, h)),
            None => {
                self.waiting.entry(parent).or_default().push(id);
                Insert::Pending
            }
        }
    }

    /// Link `start` at `height`, then every waiting descendant depth-first.
    fn link(&mut self, start: NodeId, height: u32) -> Vec<NodeId> {
        let mut linked = Vec::new();
        let mut stack = vec![(start, height)];
        while let Some((id, h)) = stack.pop() {
            self.nodes[id].height = Some(h);
            linked.push(id);
            self.consider_tip(id, h);
            if let Some(children) = self.waiting.remove(&self.nodes[id].hash()) {
                // reversed so the first-seen child is linked first
                for child in children.into_iter().rev() {
                    stack.push((child, h + 1));
                }
            }
        }
        linked
    }

    fn consider_tip(&mut self, id: NodeId, height: u32) {
        let better = match self.tip {
            None => true,
            Some(tip) => {
                let tip_height = self.best.tip_height().unwrap_or(0);
                height > tip_height || (height == tip_height && id < tip)
            }
        };
        if better {
            self.adopt(id, height);
        }
    }

    /// Make `id` the tip, replacing the best-chain suffix above the fork point.
    fn adopt(&mut self, id: NodeId, height: u32) {
        let mut path = Vec::new();
        let mut fork_height = 0;
        let mut cursor = Some((id, height));
        while let Some((cur, h)) = cursor {
            let node = &self.nodes[cur];
            if self.best.hash_at(h) == Some(node.hash()) {
                fork_height = h + 1;
                break;
            }
            path.push(node.hash());
            cursor = match (node.record.is_genesis(), h.checked_sub(1)) {
                (false, Some(parent_height)) => self
                    .by_hash
                    .get(&node.parent_hash())
                    .map(|&parent| (parent, parent_height)),
                _ => None,
            };
        }
        path.reverse();

        let dropped = self.best.hashes.split_off(fork_height as usize);
        self.best.hashes.extend_from_slice(&path);
        self.tip = Some(id);

        if dropped.is_empty() {
            return;
        }
        let reorg_type = classify(fork_height, self.persisted_len);
        if reorg_type == ReorgType::CacheReorg {
            self.persisted_len = fork_height;
        }
        tracing::warn!(
            fork_height,
            depth = dropped.len(),
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        self.reorgs.push(ReorgEvent {
            fork_height,
            dropped,
            adopted: path,
            reorg_type,
        });
    }

    /// Rebuild the best chain as the ancestry of `id`, without raising events.
    fn force_tip(&mut self, id: NodeId) {
        if let Ok(branch) = self.branch_to(self.nodes[id].hash()) {
            self.best = branch;
            self.tip = Some(id);
        }
    }

    /// Reorgs raised since the last call, oldest first.
    pub fn drain_reorgs(&mut self) -> Vec<ReorgEvent> {
        std::mem::take(&mut self.reorgs)
    }

    pub fn best_chain(&self) -> &BestChain {
        &self.best
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.best.tip_height()
    }

    /// Record that the cache now holds the whole current best chain.
    pub fn mark_persisted(&mut self) {
        self.persisted_len = self.best.len() as u32;
    }

    pub fn persisted_len(&self) -> u32 {
        self.persisted_len
    }

    pub fn node(&self, id: NodeId) -> &ChainNode {
        &self.nodes[id]
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&ChainNode> {
        self.by_hash.get(hash).map(|&id| &self.nodes[id])
    }

    /// Total number of records held, linked or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records still waiting for a parent.
    pub fn unresolved_count(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    /// Records still waiting for a parent, ordered by position.
    pub fn unresolved(&self) -> Vec<BlockRecord> {
        let mut records: Vec<BlockRecord> = self
            .waiting
            .values()
            .flatten()
            .map(|&id| self.nodes[id].record.clone())
            .collect();
        records.sort_by_key(BlockRecord::position);
        records
    }

    /// Linked nodes at or above `height`, ordered by height then first-seen.
    pub fn linked_from(&self, height: u32) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = (0..self.nodes.len())
            .filter(|&id| matches!(self.nodes[id].height, Some(h) if h >= height))
            .collect();
        ids.sort_by_key(|&id| (self.nodes[id].height, id));
        ids
    }

    /// The cache entry for a linked node.
    pub fn entry(&self, id: NodeId) -> Option<IndexCacheEntry> {
        let node = &self.nodes[id];
        node.height
            .map(|h| IndexCacheEntry::from_record(&node.record, h))
    }

    /// The chain from genesis to `hash`, which need not be the best tip.
    pub fn branch_to(&self, hash: BlockHash) -> Result<BestChain, IterError> {
        let mut id = match self.by_hash.get(&hash) {
            Some(&id) if self.nodes[id].is_linked() => id,
            _ => return Err(IterError::UnknownBlock(hash)),
        };
        let mut hashes = Vec::new();
        loop {
            let node = &self.nodes[id];
            hashes.push(node.hash());
            if node.height == Some(0) {
                break;
            }
            match self.by_hash.get(&node.parent_hash()) {
                Some(&parent) => id = parent,
                None => return Err(IterError::UnknownBlock(node.parent_hash())),
            }
        }
        hashes.reverse();
        Ok(BestChain { hashes })
    }
}
