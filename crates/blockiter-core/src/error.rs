//! Error types for the block iteration pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::BlockHash;

/// Errors that can occur while scanning, indexing, or iterating blocks.
#[derive(Debug, Error)]
pub enum IterError {
    #[error("block directory '{}' is missing or unreadable: {source}", .path.display())]
    MissingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record whose declared length does not fit the file. Scanning treats
    /// this as the end of that file.
    #[error("corrupt record in block file {file_id} at offset {offset}: {reason}")]
    CorruptRecord {
        file_id: u32,
        offset: u64,
        reason: String,
    },

    /// Unreadable persisted index. Recovered by discarding the cache.
    #[error("index cache is corrupt: {0}")]
    CacheCorrupt(String),

    /// The cache could not be written.
    #[error("index cache error: {0}")]
    Cache(String),

    #[error("height {requested} is unreachable (best tip: {})", fmt_tip(.tip))]
    HeightUnreachable { requested: u32, tip: Option<u32> },

    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),

    #[error("duplicate block file for index {file_id}: '{}' and '{}'", .first.display(), .second.display())]
    DuplicateBlockFile {
        file_id: u32,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Transaction bytes that do not decode. `offset` is relative to the
    /// start of the transaction data (the count varint).
    #[error("invalid transaction data at byte {offset}: {reason}")]
    InvalidTransaction { offset: usize, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("block handler failed: {0}")]
    Handler(String),
}

impl IterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for errors the pipeline heals on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. } | Self::CacheCorrupt(_))
    }

    /// Returns `true` if the error ends an `iterate` call.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

fn fmt_tip(tip: &Option<u32>) -> String {
    match tip {
        Some(height) => height.to_string(),
        None => "no chain".into(),
    }
}
