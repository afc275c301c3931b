//! SQLite-backed index store.
//!
//! Persists the index cache in `<cachedir>/index.sqlite`. Every mutation runs
//! inside a single transaction, so an interrupted run leaves either the old or
//! the new state on disk, never a mix.
//!
//! ## Schema
//! ```sql
//! CREATE TABLE bi_entries (
//!     seq         INTEGER PRIMARY KEY AUTOINCREMENT,  -- append order
//!     hash        BLOB    NOT NULL UNIQUE,
//!     height      INTEGER NOT NULL,
//!     file_id     INTEGER NOT NULL,
//!     byte_offset INTEGER NOT NULL,
//!     length      INTEGER NOT NULL,
//!     header      BLOB    NOT NULL                    -- raw 80 bytes
//! );
//! CREATE TABLE bi_orphans (                          -- unlinked records
//!     hash        BLOB    PRIMARY KEY,
//!     file_id     INTEGER NOT NULL,
//!     byte_offset INTEGER NOT NULL,
//!     length      INTEGER NOT NULL,
//!     header      BLOB    NOT NULL
//! );
//! CREATE TABLE bi_files (
//!     file_id    INTEGER PRIMARY KEY,
//!     len        INTEGER NOT NULL,
//!     modified   INTEGER,                             -- ns since epoch
//!     scanned_to INTEGER NOT NULL
//! );
//! CREATE TABLE bi_meta  (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! `bi_meta` holds `format_version`, `magic`, `cursor_file`, `cursor_offset`,
//! `tip` and `updated_at`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use blockiter_core::cursor::ScanCursor;
use blockiter_core::error::IterError;
use blockiter_core::index::{
    CacheSnapshot, FileFingerprint, IndexCacheEntry, IndexStore, ScanState, CACHE_FORMAT_VERSION,
};
use blockiter_core::types::{BlockHash, BlockHeader, BlockRecord, Network, HEADER_SIZE};

/// File name of the database inside the cache directory.
pub const INDEX_FILE_NAME: &str = "index.sqlite";

/// SQLite-backed index store.
pub struct SqliteIndexStore {
    conn: Connection,
    /// `None` for in-memory databases.
    path: Option<PathBuf>,
    magic: u32,
    queued: Vec<IndexCacheEntry>,
}

impl SqliteIndexStore {
    /// Open (or create) the index inside `cachedir`, creating the directory
    /// if needed.
    ///
    /// A database that exists but cannot be read is not an error here; it is
    /// reported as [`IterError::CacheCorrupt`] by [`IndexStore::load`].
    pub fn open(cachedir: impl AsRef<Path>, network: Network) -> Result<Self, IterError> {
        let cachedir = cachedir.as_ref();
        std::fs::create_dir_all(cachedir).map_err(|e| IterError::io(cachedir, e))?;
        let path = cachedir.join(INDEX_FILE_NAME);
        let conn = Connection::open(&path).map_err(sqlite_err)?;
        Ok(Self {
            conn,
            path: Some(path),
            magic: network.magic(),
            queued: Vec::new(),
        })
    }

    /// Open a throwaway in-memory index (useful for tests).
    pub fn in_memory(network: Network) -> Result<Self, IterError> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Ok(Self {
            conn,
            path: None,
            magic: network.magic(),
            queued: Vec::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create tables and stamp a fresh database with version and magic.
    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bi_entries (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                hash    BLOB    NOT NULL UNIQUE,
                height  INTEGER NOT NULL,
                file_id INTEGER NOT NULL,
                byte_offset INTEGER NOT NULL,
                length  INTEGER NOT NULL,
                header  BLOB    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS bi_entries_height ON bi_entries (height);
            CREATE TABLE IF NOT EXISTS bi_orphans (
                hash    BLOB    PRIMARY KEY,
                file_id INTEGER NOT NULL,
                byte_offset INTEGER NOT NULL,
                length  INTEGER NOT NULL,
                header  BLOB    NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bi_files (
                file_id    INTEGER PRIMARY KEY,
                len        INTEGER NOT NULL,
                modified   INTEGER,
                scanned_to INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS bi_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO bi_meta (key, value) VALUES ('format_version', ?1)",
            params![CACHE_FORMAT_VERSION.to_string()],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO bi_meta (key, value) VALUES ('magic', ?1)",
            params![self.magic.to_string()],
        )?;
        Ok(())
    }

    fn meta(&self, key: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM bi_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
    }

    fn read_snapshot(&self) -> Result<CacheSnapshot, IterError> {
        let version = self.meta("format_version").map_err(corrupt)?;
        if version.as_deref() != Some(CACHE_FORMAT_VERSION.to_string().as_str()) {
            return Err(IterError::CacheCorrupt(format!(
                "format version {version:?}, expected {CACHE_FORMAT_VERSION}"
            )));
        }
        let magic = self.meta("magic").map_err(corrupt)?;
        if magic.as_deref() != Some(self.magic.to_string().as_str()) {
            return Err(IterError::CacheCorrupt(format!(
                "built for magic {magic:?}, expected {}",
                self.magic
            )));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT hash, height, file_id, byte_offset, length, header
                 FROM bi_entries ORDER BY seq",
            )
            .map_err(corrupt)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                ))
            })
            .map_err(corrupt)?;

        let mut entries = Vec::new();
        for row in rows {
            let (hash, height, file_id, offset, length, header) = row.map_err(corrupt)?;
            entries.push(IndexCacheEntry {
                hash: stored_hash(hash)?,
                height,
                file_id,
                offset: stored_offset(offset)?,
                length,
                header: stored_header(header)?,
            });
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT hash, file_id, byte_offset, length, header
                 FROM bi_orphans ORDER BY file_id, byte_offset",
            )
            .map_err(corrupt)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .map_err(corrupt)?;
        let mut orphans = Vec::new();
        for row in rows {
            let (hash, file_id, offset, length, header) = row.map_err(corrupt)?;
            let hash = stored_hash(hash)?;
            let record =
                BlockRecord::new(stored_header(header)?, length, file_id, stored_offset(offset)?);
            if record.hash != hash {
                return Err(IterError::CacheCorrupt(format!("orphan {hash} does not hash")));
            }
            orphans.push(record);
        }

        let mut files = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT file_id, len, modified, scanned_to FROM bi_files")
            .map_err(corrupt)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(corrupt)?;
        for row in rows {
            let (file_id, len, modified, scanned_to) = row.map_err(corrupt)?;
            files.insert(
                file_id,
                FileFingerprint {
                    len: stored_offset(len)?,
                    modified,
                    scanned_to: stored_offset(scanned_to)?,
                },
            );
        }

        let cursor = match (
            self.meta("cursor_file").map_err(corrupt)?,
            self.meta("cursor_offset").map_err(corrupt)?,
        ) {
            (Some(file), Some(offset)) => ScanCursor::new(
                file.parse().map_err(|_| IterError::CacheCorrupt(format!("cursor file {file}")))?,
                offset
                    .parse()
                    .map_err(|_| IterError::CacheCorrupt(format!("cursor offset {offset}")))?,
            ),
            _ => ScanCursor::START,
        };
        let tip = self
            .meta("tip")
            .map_err(corrupt)?
            .map(|hex| {
                BlockHash::from_hex(&hex).map_err(|e| IterError::CacheCorrupt(e.to_string()))
            })
            .transpose()?;

        Ok(CacheSnapshot {
            entries,
            cursor,
            tip,
            files,
            orphans,
        })
    }

    /// Insert queued entries within `tx`.
    fn write_queued(tx: &rusqlite::Transaction<'_>, queued: &[IndexCacheEntry]) -> rusqlite::Result<()> {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO bi_entries (hash, height, file_id, byte_offset, length, header)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for e in queued {
            stmt.execute(params![
                e.hash.as_bytes().as_slice(),
                e.height,
                e.file_id,
                e.offset as i64,
                e.length,
                e.header.encode().as_slice(),
            ])?;
        }
        Ok(())
    }

    /// Replace the file fingerprints and orphans within `tx`.
    fn write_scan_state(
        tx: &rusqlite::Transaction<'_>,
        files: &BTreeMap<u32, FileFingerprint>,
        orphans: &[BlockRecord],
    ) -> rusqlite::Result<()> {
        tx.execute("DELETE FROM bi_files", [])?;
        let mut stmt = tx.prepare(
            "INSERT INTO bi_files (file_id, len, modified, scanned_to) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (file_id, fp) in files {
            stmt.execute(params![
                file_id,
                fp.len as i64,
                fp.modified,
                fp.scanned_to as i64
            ])?;
        }

        tx.execute("DELETE FROM bi_orphans", [])?;
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO bi_orphans (hash, file_id, byte_offset, length, header)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for o in orphans {
            stmt.execute(params![
                o.hash.as_bytes().as_slice(),
                o.file_id,
                o.offset as i64,
                o.length,
                o.header.encode().as_slice(),
            ])?;
        }
        Ok(())
    }

    fn put_meta(tx: &rusqlite::Transaction<'_>, key: &str, value: &str) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO bi_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

impl IndexStore for SqliteIndexStore {
    fn load(&mut self) -> Result<CacheSnapshot, IterError> {
        self.queued.clear();
        self.init_schema().map_err(corrupt)?;
        let snapshot = self.read_snapshot()?;
        debug!(
            entries = snapshot.entries.len(),
            cursor = %snapshot.cursor,
            "Index cache loaded"
        );
        Ok(snapshot)
    }

    fn append(&mut self, entry: IndexCacheEntry) -> Result<(), IterError> {
        self.queued.push(entry);
        Ok(())
    }

    fn truncate(&mut self, height: u32) -> Result<(), IterError> {
        let queued = std::mem::take(&mut self.queued);
        let tx = self.conn.transaction().map_err(sqlite_err)?;
        Self::write_queued(&tx, &queued).map_err(sqlite_err)?;

        let earliest: Option<(u32, i64)> = tx
            .query_row(
                "SELECT file_id, byte_offset FROM bi_entries WHERE height >= ?1
                 ORDER BY file_id, byte_offset LIMIT 1",
                params![height],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sqlite_err)?;
        let dropped = tx
            .execute("DELETE FROM bi_entries WHERE height >= ?1", params![height])
            .map_err(sqlite_err)?;

        if let Some((file_id, offset)) = earliest {
            let stored: Option<(String, String)> = tx
                .query_row(
                    "SELECT f.value, o.value FROM bi_meta f, bi_meta o
                     WHERE f.key = 'cursor_file' AND o.key = 'cursor_offset'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sqlite_err)?;
            let mut cursor = stored
                .and_then(|(f, o)| Some(ScanCursor::new(f.parse().ok()?, o.parse().ok()?)))
                .unwrap_or(ScanCursor::START);
            cursor.rewind_to(ScanCursor::new(file_id, offset.max(0) as u64));
            Self::put_meta(&tx, "cursor_file", &cursor.file_id.to_string()).map_err(sqlite_err)?;
            Self::put_meta(&tx, "cursor_offset", &cursor.offset.to_string()).map_err(sqlite_err)?;
        }

        // drop the tip if its entry went with the suffix
        let tip: Option<String> = tx
            .query_row("SELECT value FROM bi_meta WHERE key = 'tip'", [], |row| row.get(0))
            .optional()
            .map_err(sqlite_err)?;
        if let Some(tip) = tip.and_then(|hex| BlockHash::from_hex(&hex).ok()) {
            let kept = tx
                .query_row(
                    "SELECT 1 FROM bi_entries WHERE hash = ?1",
                    params![tip.as_bytes().as_slice()],
                    |_| Ok(()),
                )
                .optional()
                .map_err(sqlite_err)?
                .is_some();
            if !kept {
                tx.execute("DELETE FROM bi_meta WHERE key = 'tip'", [])
                    .map_err(sqlite_err)?;
            }
        }

        tx.commit().map_err(sqlite_err)?;
        debug!(height, dropped, "Index cache truncated");
        Ok(())
    }

    fn flush(&mut self, state: &ScanState) -> Result<(), IterError> {
        let ScanState {
            cursor,
            tip,
            files,
            orphans,
        } = state;
        let queued = std::mem::take(&mut self.queued);
        let tx = self.conn.transaction().map_err(sqlite_err)?;
        Self::write_queued(&tx, &queued).map_err(sqlite_err)?;
        Self::write_scan_state(&tx, files, orphans).map_err(sqlite_err)?;

        Self::put_meta(&tx, "cursor_file", &cursor.file_id.to_string()).map_err(sqlite_err)?;
        Self::put_meta(&tx, "cursor_offset", &cursor.offset.to_string()).map_err(sqlite_err)?;
        match tip {
            Some(tip) => Self::put_meta(&tx, "tip", &tip.to_hex()).map_err(sqlite_err)?,
            None => {
                tx.execute("DELETE FROM bi_meta WHERE key = 'tip'", [])
                    .map_err(sqlite_err)?;
            }
        }
        Self::put_meta(&tx, "updated_at", &chrono::Utc::now().to_rfc3339()).map_err(sqlite_err)?;

        tx.commit().map_err(sqlite_err)?;
        debug!(
            entries = queued.len(),
            orphans = orphans.len(),
            %cursor,
            "Index cache committed"
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<(), IterError> {
        self.queued.clear();
        if let Some(path) = self.path.clone() {
            // swap in a scratch connection so the file handle is released
            let old = std::mem::replace(
                &mut self.conn,
                Connection::open_in_memory().map_err(sqlite_err)?,
            );
            drop(old);
            for suffix in ["", "-wal", "-shm"] {
                let file = PathBuf::from(format!("{}{suffix}", path.display()));
                match std::fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(IterError::io(file, e)),
                }
            }
            self.conn = Connection::open(&path).map_err(sqlite_err)?;
        } else {
            self.conn = Connection::open_in_memory().map_err(sqlite_err)?;
        }
        self.init_schema().map_err(sqlite_err)?;
        debug!("Index cache reset");
        Ok(())
    }
}

fn sqlite_err(e: rusqlite::Error) -> IterError {
    IterError::Cache(format!("sqlite: {e}"))
}

fn corrupt(e: rusqlite::Error) -> IterError {
    IterError::CacheCorrupt(format!("sqlite: {e}"))
}

fn stored_hash(bytes: Vec<u8>) -> Result<BlockHash, IterError> {
    let hash: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IterError::CacheCorrupt("hash is not 32 bytes".into()))?;
    Ok(BlockHash::from_bytes(hash))
}

fn stored_header(bytes: Vec<u8>) -> Result<BlockHeader, IterError> {
    let header: [u8; HEADER_SIZE] = bytes
        .try_into()
        .map_err(|_| IterError::CacheCorrupt("header is not 80 bytes".into()))?;
    Ok(BlockHeader::decode(&header))
}

fn stored_offset(value: i64) -> Result<u64, IterError> {
    u64::try_from(value).map_err(|_| IterError::CacheCorrupt(format!("negative offset {value}")))
}
