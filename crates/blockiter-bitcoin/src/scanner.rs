//! Raw block-file scanner.
//!
//! Reads `blkNNNNN.dat` files record by record without deserializing
//! transactions. Each record is `magic | length | payload`, where the payload
//! starts with the 80-byte header. Records may be separated by padding; the
//! scanner searches forward for the next magic.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use blockiter_core::error::IterError;
use blockiter_core::index::FileFingerprint;
use blockiter_core::transaction::read_compact_size;
use blockiter_core::types::{BlockHeader, BlockRecord, HEADER_SIZE, RECORD_PREFIX_SIZE};

/// Open handles kept by [`BlockReader`].
const OPEN_FILE_CACHE: usize = 2;

/// One block file found in the block directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFile {
    pub id: u32,
    pub path: PathBuf,
    /// Length at discovery time.
    pub len: u64,
    /// Modification time at discovery, nanoseconds since the Unix epoch.
    pub modified: Option<i64>,
}

impl BlockFile {
    /// Fingerprint to persist after scanning this file up to `scanned_to`.
    pub fn fingerprint(&self, scanned_to: u64) -> FileFingerprint {
        FileFingerprint {
            len: self.len,
            modified: self.modified,
            scanned_to,
        }
    }
}

fn modified_nanos(meta: &Metadata) -> Option<i64> {
    let since_epoch = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_nanos()).ok()
}

/// The block files of a directory, ordered by file id.
#[derive(Debug, Clone, Default)]
pub struct BlockFiles {
    files: BTreeMap<u32, BlockFile>,
}

impl BlockFiles {
    /// List `blk*.dat` files in `dir`.
    ///
    /// Fails with [`IterError::MissingDirectory`] if `dir` cannot be read and
    /// with [`IterError::DuplicateBlockFile`] if two names share an id.
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self, IterError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| IterError::MissingDirectory {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: BTreeMap<u32, BlockFile> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| IterError::io(dir, e))?;
            let Some(id) = entry.file_name().to_str().and_then(parse_file_id) else {
                continue;
            };
            let path = entry.path();
            let meta = entry.metadata().map_err(|e| IterError::io(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            if let Some(first) = files.get(&id) {
                return Err(IterError::DuplicateBlockFile {
                    file_id: id,
                    first: first.path.clone(),
                    second: path,
                });
            }
            files.insert(
                id,
                BlockFile {
                    id,
                    path,
                    len: meta.len(),
                    modified: modified_nanos(&meta),
                },
            );
        }

        let mut expected = 0;
        for &id in files.keys() {
            if id != expected {
                tracing::warn!(missing_from = expected, missing_to = id - 1, "Gap in block file numbering");
            }
            expected = id.saturating_add(1);
        }

        tracing::debug!(dir = %dir.display(), files = files.len(), "Block files discovered");
        Ok(Self { files })
    }

    pub fn get(&self, id: u32) -> Option<&BlockFile> {
        self.files.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockFile> {
        self.files.values()
    }

    /// Files with id `>= id`, ascending.
    pub fn from_id(&self, id: u32) -> impl Iterator<Item = &BlockFile> {
        self.files.range(id..).map(|(_, f)| f)
    }

    pub fn last(&self) -> Option<&BlockFile> {
        self.files.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// `blk00042.dat` → `Some(42)`.
pub fn parse_file_id(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("blk")?.strip_suffix(".dat")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ─── FileScanner ──────────────────────────────────────────────────────────────

/// Lazy sequence of the records in one block file, starting at an offset.
///
/// A truncated or malformed record yields one [`IterError::CorruptRecord`] and
/// ends the sequence; [`FileScanner::scanned_to`] then points at that record.
pub struct FileScanner {
    file_id: u32,
    path: PathBuf,
    reader: BufReader<File>,
    magic: u32,
    len: u64,
    pos: u64,
    scanned_to: u64,
    done: bool,
}

impl FileScanner {
    pub fn open(file: &BlockFile, magic: u32, offset: u64) -> Result<Self, IterError> {
        let mut handle = File::open(&file.path).map_err(|e| IterError::io(&file.path, e))?;
        let len = handle
            .metadata()
            .map_err(|e| IterError::io(&file.path, e))?
            .len();
        let offset = offset.min(len);
        handle
            .seek(SeekFrom::Start(offset))
            .map_err(|e| IterError::io(&file.path, e))?;
        Ok(Self {
            file_id: file.id,
            path: file.path.clone(),
            reader: BufReader::with_capacity(1 << 16, handle),
            magic,
            len,
            pos: offset,
            scanned_to: offset,
            done: false,
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// End of the last complete record read, or the offset of the corrupt
    /// record that ended the scan. Trailing padding is not included, since a
    /// node fills preallocated space later.
    pub fn scanned_to(&self) -> u64 {
        self.scanned_to
    }

    fn io(&self, e: std::io::Error) -> IterError {
        IterError::io(&self.path, e)
    }

    fn corrupt(&mut self, offset: u64, reason: String) -> IterError {
        self.done = true;
        self.pos = offset;
        self.scanned_to = offset;
        IterError::CorruptRecord {
            file_id: self.file_id,
            offset,
            reason,
        }
    }

    /// Advance past the next magic. Returns its offset, or `None` at end of file.
    fn seek_magic(&mut self) -> Result<Option<u64>, IterError> {
        let start = self.pos;
        let magic_zeros = self.magic.to_le_bytes().iter().filter(|&&b| b == 0).count() as u64;
        let mut window: u32 = 0;
        let mut seen: u64 = 0;
        let mut zeros: u64 = 0;

        loop {
            let buf = self
                .reader
                .fill_buf()
                .map_err(|e| IterError::io(&self.path, e))?;
            if buf.is_empty() {
                self.pos = start + seen;
                if seen > 0 && zeros < seen {
                    tracing::warn!(
                        file_id = self.file_id,
                        offset = start,
                        skipped = seen,
                        "Skipped trailing bytes without a record"
                    );
                }
                return Ok(None);
            }

            let mut found = None;
            for (i, &b) in buf.iter().enumerate() {
                window = (window >> 8) | (u32::from(b) << 24);
                seen += 1;
                if b == 0 {
                    zeros += 1;
                }
                if seen >= 4 && window == self.magic {
                    found = Some(i + 1);
                    break;
                }
            }
            match found {
                Some(used) => {
                    self.reader.consume(used);
                    let at = start + seen - 4;
                    let skipped = seen - 4;
                    if skipped > 0 {
                        if zeros - magic_zeros < skipped {
                            tracing::warn!(
                                file_id = self.file_id,
                                offset = start,
                                skipped,
                                "Skipped bytes before record"
                            );
                        } else {
                            tracing::debug!(file_id = self.file_id, offset = start, skipped, "Skipped zero padding");
                        }
                    }
                    return Ok(Some(at));
                }
                None => {
                    let used = buf.len();
                    self.reader.consume(used);
                }
            }
        }
    }

    fn read_record(&mut self) -> Result<Option<BlockRecord>, IterError> {
        let Some(at) = self.seek_magic()? else {
            return Ok(None);
        };

        let mut word = [0u8; 4];
        if at + RECORD_PREFIX_SIZE > self.len || self.reader.read_exact(&mut word).is_err() {
            let remain = self.len.saturating_sub(at);
            return Err(self.corrupt(at, format!("record prefix truncated, {remain} bytes remain")));
        }
        let length = u32::from_le_bytes(word);
        if (length as usize) < HEADER_SIZE {
            return Err(self.corrupt(at, format!("declared length {length} is shorter than a header")));
        }
        let payload_at = at + RECORD_PREFIX_SIZE;
        let remain = self.len - payload_at;
        if u64::from(length) > remain {
            return Err(self.corrupt(at, format!("declared {length} bytes, {remain} remain")));
        }

        let mut raw = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut raw) {
            return Err(self.io(e));
        }
        let rest = i64::from(length) - HEADER_SIZE as i64;
        if let Err(e) = self.reader.seek_relative(rest) {
            return Err(self.io(e));
        }

        let record = BlockRecord::new(BlockHeader::decode(&raw), length, self.file_id, at);
        self.pos = record.end_offset();
        self.scanned_to = self.pos;
        Ok(Some(record))
    }
}

impl Iterator for FileScanner {
    type Item = Result<BlockRecord, IterError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ─── BlockReader ──────────────────────────────────────────────────────────────

/// Random-access reads of records already located by a scan.
///
/// Keeps the two most recently opened files open.
pub struct BlockReader {
    paths: BTreeMap<u32, PathBuf>,
    magic: u32,
    open: VecDeque<(u32, File)>,
}

impl BlockReader {
    pub fn new(files: &BlockFiles, magic: u32) -> Self {
        Self {
            paths: files.iter().map(|f| (f.id, f.path.clone())).collect(),
            magic,
            open: VecDeque::with_capacity(OPEN_FILE_CACHE),
        }
    }

    fn handle(&mut self, file_id: u32) -> Result<(&Path, &mut File), IterError> {
        let path = self
            .paths
            .get(&file_id)
            .ok_or_else(|| IterError::CorruptRecord {
                file_id,
                offset: 0,
                reason: "block file is gone".into(),
            })?;
        let slot = match self.open.iter().position(|(id, _)| *id == file_id) {
            Some(slot) => slot,
            None => {
                let file = File::open(path).map_err(|e| IterError::io(path, e))?;
                if self.open.len() == OPEN_FILE_CACHE {
                    self.open.pop_front();
                }
                self.open.push_back((file_id, file));
                self.open.len() - 1
            }
        };
        Ok((path.as_path(), &mut self.open[slot].1))
    }

    fn read_at(&mut self, file_id: u32, offset: u64, buf: &mut [u8]) -> Result<(), IterError> {
        let (path, file) = self.handle(file_id)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| IterError::io(path, e))?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IterError::CorruptRecord {
                    file_id,
                    offset,
                    reason: "record runs past end of file".into(),
                }
            } else {
                IterError::io(path, e)
            }
        })
    }

    /// Re-read the record prefix and header at `offset`.
    pub fn record_at(&mut self, file_id: u32, offset: u64) -> Result<BlockRecord, IterError> {
        let mut raw = [0u8; RECORD_PREFIX_SIZE as usize + HEADER_SIZE];
        self.read_at(file_id, offset, &mut raw)?;
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != self.magic {
            return Err(IterError::CorruptRecord {
                file_id,
                offset,
                reason: format!("expected magic {:#010x}, found {magic:#010x}", self.magic),
            });
        }
        let length = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&raw[RECORD_PREFIX_SIZE as usize..]);
        Ok(BlockRecord::new(BlockHeader::decode(&header), length, file_id, offset))
    }

    /// Read a record's payload: the header followed by the transactions.
    pub fn payload(&mut self, record: &BlockRecord) -> Result<Vec<u8>, IterError> {
        let mut payload = vec![0u8; record.length as usize];
        self.read_at(record.file_id, record.payload_offset(), &mut payload)?;
        if payload.get(..HEADER_SIZE) != Some(&record.raw_header()[..]) {
            return Err(IterError::CorruptRecord {
                file_id: record.file_id,
                offset: record.offset,
                reason: format!("block {} changed on disk", record.hash),
            });
        }
        Ok(payload)
    }

    /// Read the transaction count that follows a record's header, without
    /// loading the rest of the payload.
    pub fn transaction_count(&mut self, record: &BlockRecord) -> Result<Option<u64>, IterError> {
        let available = (record.length as usize).saturating_sub(HEADER_SIZE).min(9);
        let mut buf = [0u8; 9];
        self.read_at(
            record.file_id,
            record.payload_offset() + HEADER_SIZE as u64,
            &mut buf[..available],
        )?;
        Ok(read_compact_size(&buf[..available]).map(|(count, _)| count))
    }
}
