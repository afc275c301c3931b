//! Shared types: block hashes, the 80-byte header codec, and block records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::cursor::ScanCursor;
use crate::error::IterError;
use crate::transaction::{decode_transactions, read_compact_size, Transaction};

/// Size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Bytes preceding every payload in a block file: network magic + declared length.
pub const RECORD_PREFIX_SIZE: u64 = 8;

// ─── BlockHash ────────────────────────────────────────────────────────────────

/// A 32-byte double-SHA-256 digest, stored in wire (little-endian) order.
///
/// Displays and parses in the reversed, block-explorer order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// The all-zero hash; the parent of every genesis block.
    pub const ZERO: Self = Self([0; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// `SHA256(SHA256(data))`.
    pub fn double_sha256(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        Self(second.into())
    }

    /// Hex in display order (byte-reversed).
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Parse a 64-character display-order hex string.
    pub fn from_hex(s: &str) -> Result<Self, IterError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| IterError::InvalidHash(format!("{s}: {e}")))?;
        let mut out: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IterError::InvalidHash(format!("{s}: expected 32 bytes")))?;
        out.reverse();
        Ok(Self(out))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = IterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Network ──────────────────────────────────────────────────────────────────

/// Which network's block files are being read. Selects the record magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
    /// Any other chain using the same file layout.
    Custom(u32),
}

impl Network {
    /// The little-endian `u32` that starts every record.
    pub const fn magic(&self) -> u32 {
        match self {
            Self::Mainnet => 0xD9B4_BEF9,
            Self::Testnet => 0x0709_110B,
            Self::Regtest => 0xDAB5_BFFA,
            Self::Custom(magic) => *magic,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Regtest => write!(f, "regtest"),
            Self::Custom(magic) => write!(f, "custom({magic:#010x})"),
        }
    }
}

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// A decoded 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: BlockHash,
    pub merkle_root: BlockHash,
    /// Unix timestamp (seconds).
    pub timestamp: u32,
    /// Compact difficulty target. Carried, never checked.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let hash_at = |at: usize| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&raw[at..at + 32]);
            BlockHash::from_bytes(out)
        };
        Self {
            version: u32_at(0),
            prev_hash: hash_at(4),
            merkle_root: hash_at(36),
            timestamp: u32_at(68),
            bits: u32_at(72),
            nonce: u32_at(76),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.version.to_le_bytes());
        raw[4..36].copy_from_slice(self.prev_hash.as_bytes());
        raw[36..68].copy_from_slice(self.merkle_root.as_bytes());
        raw[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        raw[72..76].copy_from_slice(&self.bits.to_le_bytes());
        raw[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        raw
    }

    /// The block hash: double SHA-256 over the serialized header.
    pub fn hash(&self) -> BlockHash {
        BlockHash::double_sha256(&self.encode())
    }

    /// A header with an all-zero parent roots a chain.
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

// ─── BlockRecord ──────────────────────────────────────────────────────────────

/// One record found in a block file. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: BlockHash,
    pub header: BlockHeader,
    /// Declared payload length (header + transactions).
    pub length: u32,
    /// Numeric suffix of the `blkNNNNN.dat` file.
    pub file_id: u32,
    /// Offset of the record's magic within the file.
    pub offset: u64,
}

impl BlockRecord {
    pub fn new(header: BlockHeader, length: u32, file_id: u32, offset: u64) -> Self {
        Self {
            hash: header.hash(),
            header,
            length,
            file_id,
            offset,
        }
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    pub fn raw_header(&self) -> [u8; HEADER_SIZE] {
        self.header.encode()
    }

    pub fn position(&self) -> ScanCursor {
        ScanCursor::new(self.file_id, self.offset)
    }

    /// Where the payload (header first) begins.
    pub fn payload_offset(&self) -> u64 {
        self.offset + RECORD_PREFIX_SIZE
    }

    /// First byte after this record.
    pub fn end_offset(&self) -> u64 {
        self.payload_offset() + u64::from(self.length)
    }
}

// ─── Callback views ───────────────────────────────────────────────────────────

/// A block handed to the caller during iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u32,
    pub hash: BlockHash,
    pub header: BlockHeader,
    pub file_id: u32,
    pub offset: u64,
    /// Header followed by the serialized transactions. Empty when payload
    /// loading is disabled.
    pub payload: Vec<u8>,
}

impl Block {
    /// The serialized transactions (payload after the header).
    pub fn transactions_bytes(&self) -> &[u8] {
        self.payload.get(HEADER_SIZE..).unwrap_or(&[])
    }

    /// The transaction count that opens the block data, if the payload is
    /// loaded and long enough to hold it.
    pub fn transaction_count(&self) -> Option<u64> {
        read_compact_size(self.transactions_bytes()).map(|(count, _)| count)
    }

    /// Decode every transaction in the block.
    ///
    /// Fails with [`IterError::InvalidTransaction`] on malformed data,
    /// including a payload that was not loaded.
    pub fn transactions(&self) -> Result<Vec<Transaction>, IterError> {
        decode_transactions(self.transactions_bytes())
    }
}

/// Header-level facts about the block being visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeaderView {
    pub height: u32,
    /// Declared record length, as stored in the block file.
    pub length: u32,
    pub hash: BlockHash,
    pub header: BlockHeader,
    /// Number of transactions, read from the first bytes after the header.
    /// `None` when those bytes are not a valid count.
    pub transaction_count: Option<u64>,
}

impl HeaderView {
    /// A view without the transaction count; see
    /// [`HeaderView::with_transaction_count`].
    pub fn from_record(record: &BlockRecord, height: u32) -> Self {
        Self {
            height,
            length: record.length,
            hash: record.hash,
            header: record.header,
            transaction_count: None,
        }
    }

    pub fn with_transaction_count(self, count: Option<u64>) -> Self {
        Self {
            transaction_count: count,
            ..self
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
