//! Fluent builder API for iteration runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use blockiter_bitcoin::IterateBuilder;
//! use blockiter_core::{Flow, IterError, Network};
//!
//! let summary = IterateBuilder::new("/data/testnet3/blocks")
//!     .cachedir("/data/blockiter-testnet")
//!     .network(Network::Testnet)
//!     .start_height(100_000)
//!     .end_height(101_000)
//!     .load_payload(false)
//!     .run(|_block, header| {
//!         println!("{} {}", header.height, header.hash);
//!         Ok::<_, IterError>(Flow::Continue)
//!     })?;
//! # Ok::<(), IterError>(())
//! ```

use std::path::PathBuf;

use blockiter_core::config::IterateConfig;
use blockiter_core::error::IterError;
use blockiter_core::handler::{BlockHandler, Flow};
use blockiter_core::types::{Block, BlockHash, HeaderView, Network};

use crate::iterate::{iterate_with, HeightIterator, IterateSummary};

/// Fluent builder for [`IterateConfig`].
#[derive(Debug, Clone, Default)]
pub struct IterateBuilder {
    config: IterateConfig,
}

impl IterateBuilder {
    pub fn new(blockdir: impl Into<PathBuf>) -> Self {
        Self {
            config: IterateConfig::new(blockdir),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: IterateConfig) -> Self {
        Self { config }
    }

    /// Persist the index cache in this directory.
    pub fn cachedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cachedir = Some(dir.into());
        self
    }

    /// Keep the index in memory only.
    pub fn no_cache(mut self) -> Self {
        self.config.cachedir = None;
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.config.network = network;
        self
    }

    pub fn start_height(mut self, height: u32) -> Self {
        self.config.start_height = height;
        self
    }

    pub fn start_hash(mut self, hash: BlockHash) -> Self {
        self.config.start_hash = Some(hash);
        self
    }

    pub fn end_height(mut self, height: u32) -> Self {
        self.config.end_height = Some(height);
        self
    }

    /// Walk the branch ending at `hash` instead of the best chain.
    pub fn end_hash(mut self, hash: BlockHash) -> Self {
        self.config.end_hash = Some(hash);
        self
    }

    /// Blocks to scan past the end height before iterating.
    pub fn reorg_margin(mut self, blocks: u32) -> Self {
        self.config.reorg_margin = blocks;
        self
    }

    pub fn load_payload(mut self, load: bool) -> Self {
        self.config.load_payload = load;
        self
    }

    /// Log progress every `blocks` blocks (0 disables).
    pub fn progress_interval(mut self, blocks: u32) -> Self {
        self.config.progress_interval = blocks;
        self
    }

    pub fn build_config(self) -> IterateConfig {
        self.config
    }

    /// Scan and persist, returning an iterator positioned at the start height.
    pub fn prepare(self) -> Result<HeightIterator, IterError> {
        HeightIterator::prepare(&self.config)
    }

    /// Scan, persist, and hand every block to `blockfn`.
    pub fn run<F, E>(self, blockfn: F) -> Result<IterateSummary, E>
    where
        F: FnMut(&Block, &HeaderView) -> Result<Flow, E>,
        E: From<IterError>,
    {
        iterate_with(&self.config, blockfn)
    }

    /// Like [`IterateBuilder::run`], with any [`BlockHandler`].
    pub fn run_handler<H>(self, handler: H) -> Result<IterateSummary, H::Error>
    where
        H: BlockHandler,
        H::Error: From<IterError>,
    {
        iterate_with(&self.config, handler)
    }
}
