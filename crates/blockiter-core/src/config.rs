//! Iteration configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IterError;
use crate::types::{BlockHash, Network};

/// Configuration for one `iterate` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterateConfig {
    /// Directory holding the `blkNNNNN.dat` files. Must exist.
    pub blockdir: PathBuf,
    /// Directory for the persisted index. Created if absent; `None` keeps the
    /// index in memory only.
    pub cachedir: Option<PathBuf>,
    /// Selects the record magic.
    pub network: Network,
    /// First height handed to the callback.
    pub start_height: u32,
    /// First block handed to the callback; overrides `start_height`.
    pub start_hash: Option<BlockHash>,
    /// Last height handed to the callback (inclusive). `None` = current tip.
    pub end_height: Option<u32>,
    /// Iterate the branch ending at this block instead of the best chain.
    pub end_hash: Option<BlockHash>,
    /// Keep scanning until the tip is this far past `end_height`, so a fork
    /// near the end is resolved before iteration starts.
    pub reorg_margin: u32,
    /// Read block payloads (header + transactions) for the callback.
    pub load_payload: bool,
    /// Log progress every N blocks (0 disables).
    pub progress_interval: u32,
}

impl Default for IterateConfig {
    fn default() -> Self {
        Self {
            blockdir: PathBuf::new(),
            cachedir: None,
            network: Network::Mainnet,
            start_height: 0,
            start_hash: None,
            end_height: None,
            end_hash: None,
            reorg_margin: 100,
            load_payload: true,
            progress_interval: 10_000,
        }
    }
}

impl IterateConfig {
    pub fn new(blockdir: impl Into<PathBuf>) -> Self {
        Self {
            blockdir: blockdir.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, IterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| IterError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| IterError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option combinations that can be rejected before any I/O.
    pub fn validate(&self) -> Result<(), IterError> {
        if self.blockdir.as_os_str().is_empty() {
            return Err(IterError::Config("blockdir is required".into()));
        }
        if let Some(end) = self.end_height {
            if self.start_hash.is_none() && self.start_height > end {
                return Err(IterError::Config(format!(
                    "start height {} is above end height {end}",
                    self.start_height
                )));
            }
            if self.end_hash.is_some() {
                return Err(IterError::Config(
                    "end_height and end_hash are mutually exclusive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Height at which scanning may stop early, if an end height is set.
    pub fn scan_target(&self) -> Option<u32> {
        self.end_height
            .map(|end| end.saturating_add(self.reorg_margin))
    }
}
