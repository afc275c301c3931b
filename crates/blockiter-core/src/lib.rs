//! blockiter-core — foundation for the cached, reorg-aware block iterator.
//!
//! # Architecture
//!
//! ```text
//! iterate() → HeightIterator                     (blockiter-bitcoin)
//!                 ├── FileScanner      (blk*.dat records)
//!                 ├── ChainAssembler   (forest, best chain, reorg events)
//!                 ├── IndexCache       (persisted links + scan cursor)
//!                 └── BlockHandler     (caller callback)
//! ```

pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod handler;
pub mod index;
pub mod reorg;
pub mod transaction;
pub mod types;

pub use chain::{BestChain, ChainAssembler, ChainNode, Insert, NodeId};
pub use config::IterateConfig;
pub use cursor::ScanCursor;
pub use error::IterError;
pub use handler::{BlockHandler, Flow};
pub use index::{
    CacheSnapshot, FileFingerprint, IndexCache, IndexCacheEntry, IndexStore, ScanState,
    CACHE_FORMAT_VERSION,
};
pub use reorg::{ReorgEvent, ReorgType};
pub use transaction::{decode_transactions, Transaction, TxInput, TxOutput, Txid};
pub use types::{
    Block, BlockHash, BlockHeader, BlockRecord, HeaderView, Network, HEADER_SIZE,
    RECORD_PREFIX_SIZE,
};
