//! Reorg events raised by the chain assembler.
//!
//! Two situations produce a [`ReorgEvent`]:
//! 1. **Branch switch**: a longer branch overtakes the best chain while scanning.
//! 2. **Cache reorg**: the switch forks below the height the index cache
//!    already holds, so the cache suffix must be truncated and rewritten.
//!
//! Cached entries whose files changed on disk are handled separately, at load
//! time, by the iterator.

use crate::types::BlockHash;

/// Describes a change of the best chain below its previous tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// First height whose block changed.
    pub fork_height: u32,
    /// Hashes removed from the best chain, lowest height first.
    pub dropped: Vec<BlockHash>,
    /// Hashes that replaced them, lowest height first.
    pub adopted: Vec<BlockHash>,
    pub reorg_type: ReorgType,
}

impl ReorgEvent {
    /// Number of blocks rolled back.
    pub fn depth(&self) -> u32 {
        self.dropped.len() as u32
    }

    /// Returns `true` if persisted index entries are affected.
    pub fn affects_cache(&self) -> bool {
        self.reorg_type == ReorgType::CacheReorg
    }
}

/// Classification of the reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Fork point above the persisted height; only memory changes.
    BranchSwitch,
    /// Fork point at or below the persisted height.
    CacheReorg,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BranchSwitch => write!(f, "branch switch"),
            Self::CacheReorg => write!(f, "cache reorg"),
        }
    }
}

/// Classify a fork against the number of best-chain heights already persisted.
pub fn classify(fork_height: u32, persisted_len: u32) -> ReorgType {
    if fork_height < persisted_len {
        ReorgType::CacheReorg
    } else {
        ReorgType::BranchSwitch
    }
}
