//! blockiter-storage — index cache backends for blockiter.
//!
//! Backends:
//! - [`memory`] — in-memory (tests, runs without a cache directory)
//! - [`sqlite`] — SQLite via `rusqlite` (single-file, crash-atomic persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryIndexStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteIndexStore;
