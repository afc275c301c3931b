//! Transaction decoding — the bytes that follow the block header.
//!
//! Block data is `count | tx*`, where `count` is a compact-size integer.
//! Transactions come in two serializations:
//!
//! ```text
//! legacy: version | inputs | outputs | lock_time
//! segwit: version | 0x00 | 0x01 | inputs | outputs | witness | lock_time
//! ```
//!
//! The txid always hashes the legacy serialization; the wtxid hashes the
//! bytes as stored. Nothing here validates scripts or amounts.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::IterError;
use crate::types::BlockHash;

/// Transaction ids share the block hash representation.
pub type Txid = BlockHash;

/// Previous-output index used by coinbase inputs.
pub const COINBASE_INDEX: u32 = u32::MAX;

/// A decoded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub txid: Txid,
    /// Equal to `txid` for legacy transactions.
    pub wtxid: Txid,
    pub version: u32,
    /// Serialized with the segwit marker and flag.
    pub segwit: bool,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    /// Bytes on disk, witness included.
    pub size: u32,
    /// Virtual size: `ceil((3 * legacy_size + size) / 4)`.
    pub vsize: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        matches!(self.inputs.as_slice(), [input] if input.is_coinbase())
    }

    /// Sum of output amounts, in satoshis.
    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).fold(0, u64::saturating_add)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInput {
    pub prev_txid: Txid,
    pub prev_index: u32,
    #[serde(serialize_with = "hex_bytes")]
    pub script: Vec<u8>,
    pub sequence: u32,
    /// Witness stack items; empty for legacy transactions.
    #[serde(serialize_with = "hex_items")]
    pub witness: Vec<Vec<u8>>,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_zero() && self.prev_index == COINBASE_INDEX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutput {
    /// Satoshis.
    pub amount: u64,
    #[serde(serialize_with = "hex_bytes")]
    pub script: Vec<u8>,
}

/// Decode a compact-size integer at the start of `buf`.
///
/// Returns the value and the number of bytes it used, or `None` if `buf` is
/// too short.
pub fn read_compact_size(buf: &[u8]) -> Option<(u64, usize)> {
    let (&first, rest) = buf.split_first()?;
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        small => return Some((u64::from(small), 1)),
    };
    let bytes = rest.get(..width)?;
    let mut le = [0u8; 8];
    le[..width].copy_from_slice(bytes);
    Some((u64::from_le_bytes(le), 1 + width))
}

/// Decode every transaction in `data` (the block payload after the header).
pub fn decode_transactions(data: &[u8]) -> Result<Vec<Transaction>, IterError> {
    let mut reader = Reader::new(data);
    let count = reader.compact_size()?;
    // each transaction needs at least 10 bytes, so a huge count is garbage
    let mut txs = Vec::with_capacity(count.min(data.len() as u64 / 10) as usize);
    for _ in 0..count {
        txs.push(reader.transaction()?);
    }
    if reader.remaining() > 0 {
        tracing::debug!(
            trailing = reader.remaining(),
            transactions = txs.len(),
            "Bytes left after the last transaction"
        );
    }
    Ok(txs)
}

// ─── Reader ───────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn error(&self, reason: impl Into<String>) -> IterError {
        IterError::InvalidTransaction {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IterError> {
        if n > self.remaining() {
            return Err(self.error(format!("need {n} bytes, {} remain", self.remaining())));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, IterError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, IterError> {
        let mut le = [0u8; 8];
        le.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(le))
    }

    fn hash(&mut self) -> Result<Txid, IterError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(Txid::from_bytes(out))
    }

    fn compact_size(&mut self) -> Result<u64, IterError> {
        let (value, used) = read_compact_size(&self.buf[self.pos..])
            .ok_or_else(|| self.error("truncated compact size"))?;
        self.pos += used;
        Ok(value)
    }

    /// A length prefix, checked against the bytes left.
    fn len_prefix(&mut self) -> Result<usize, IterError> {
        let len = self.compact_size()?;
        if len > self.remaining() as u64 {
            return Err(self.error(format!("length {len} exceeds {} remaining bytes", self.remaining())));
        }
        Ok(len as usize)
    }

    /// A count of items of at least `min_size` bytes each.
    fn count(&mut self, min_size: usize) -> Result<usize, IterError> {
        let count = self.compact_size()?;
        if count.saturating_mul(min_size as u64) > self.remaining() as u64 {
            return Err(self.error(format!("count {count} exceeds remaining bytes")));
        }
        Ok(count as usize)
    }

    fn script(&mut self) -> Result<Vec<u8>, IterError> {
        let len = self.len_prefix()?;
        Ok(self.take(len)?.to_vec())
    }

    fn transaction(&mut self) -> Result<Transaction, IterError> {
        let start = self.pos;
        let version = self.u32()?;

        let segwit = self.buf.get(self.pos) == Some(&0);
        if segwit {
            self.pos += 1;
            let flag = self.take(1)?[0];
            if flag != 1 {
                self.pos -= 1;
                return Err(self.error(format!("segwit flag {flag}, expected 1")));
            }
        }
        let body_start = self.pos;

        let input_count = self.count(41)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxInput {
                prev_txid: self.hash()?,
                prev_index: self.u32()?,
                script: self.script()?,
                sequence: self.u32()?,
                witness: Vec::new(),
            });
        }
        let output_count = self.count(9)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOutput {
                amount: self.u64()?,
                script: self.script()?,
            });
        }
        let body_end = self.pos;

        if segwit {
            for input in &mut inputs {
                let items = self.count(1)?;
                input.witness.reserve(items);
                for _ in 0..items {
                    input.witness.push(self.script()?);
                }
            }
        }
        let lock_at = self.pos;
        let lock_time = self.u32()?;
        let end = self.pos;

        // txid skips the marker, flag and witness
        let mut legacy = Sha256::new();
        legacy.update(&self.buf[start..start + 4]);
        legacy.update(&self.buf[body_start..body_end]);
        legacy.update(&self.buf[lock_at..end]);
        let txid = Txid::from_bytes(Sha256::digest(legacy.finalize()).into());

        let size = (end - start) as u32;
        let legacy_size = (4 + (body_end - body_start) + 4) as u32;
        let (wtxid, vsize) = if segwit {
            let wtxid = Txid::double_sha256(&self.buf[start..end]);
            (wtxid, (3 * legacy_size + size).div_ceil(4))
        } else {
            (txid, size)
        };

        Ok(Transaction {
            txid,
            wtxid,
            version,
            segwit,
            inputs,
            outputs,
            lock_time,
            size,
            vsize,
        })
    }
}

fn hex_bytes<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

fn hex_items<S: serde::Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(items.iter().map(hex::encode))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
