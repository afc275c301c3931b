//! blockiter-bitcoin — block-file scanner, height iterator, and builder API.
//!
//! # Example
//!
//! ```rust,no_run
//! use blockiter_bitcoin::iterate;
//! use blockiter_core::{Flow, IterError};
//!
//! let summary = iterate("/data/bitcoin/blocks", "/data/blockiter", Some(1000), |block, header| {
//!     println!("{} {} {} bytes", header.height, block.hash, header.length);
//!     Ok::<_, IterError>(Flow::Continue)
//! })?;
//! println!("visited {} blocks", summary.blocks);
//! # Ok::<(), IterError>(())
//! ```

pub mod builder;
pub mod iterate;
pub mod scanner;

pub use builder::IterateBuilder;
pub use iterate::{iterate, iterate_with, Blocks, HeightIterator, IterateSummary};
pub use scanner::{BlockFile, BlockFiles, BlockReader, FileScanner};

pub use blockiter_core::{
    Block, BlockHash, Flow, HeaderView, IterError, IterateConfig, Network, Transaction, TxInput,
    TxOutput,
};
