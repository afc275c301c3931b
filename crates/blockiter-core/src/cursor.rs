//! Scan cursor — the position in the block files before which every record
//! has already been accounted for.

use serde::{Deserialize, Serialize};

/// A position across all block files, ordered by file id then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ScanCursor {
    pub file_id: u32,
    pub offset: u64,
}

impl ScanCursor {
    /// The beginning of the first file.
    pub const START: Self = Self {
        file_id: 0,
        offset: 0,
    };

    pub const fn new(file_id: u32, offset: u64) -> Self {
        Self { file_id, offset }
    }

    /// Move the cursor back to `other` if it lies earlier.
    pub fn rewind_to(&mut self, other: ScanCursor) {
        if other < *self {
            *self = other;
        }
    }

    /// Where scanning of `file_id` has to resume, or `None` if the whole file
    /// lies before the cursor.
    pub fn resume_offset(&self, file_id: u32) -> Option<u64> {
        match file_id.cmp(&self.file_id) {
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Equal => Some(self.offset),
            std::cmp::Ordering::Greater => Some(0),
        }
    }
}

impl std::fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.file_id, self.offset)
    }
}
