//! Page blob data models.

use serde::{Deserialize, Serialize};

use super::blob::ExtentChunk;

/// A range of pages in a page blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    /// Start byte offset (inclusive).
    pub start: u64,
    /// End byte offset (inclusive).
    pub end: u64,
}

impl PageRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Returns the length of this page range.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Returns true if both ranges share at least one byte.
    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if the range is aligned to page boundaries.
    pub fn is_page_aligned(&self) -> bool {
        self.start % PAGE_SIZE == 0
            && self
                .end
                .checked_add(1)
                .map_or(false, |end| end % PAGE_SIZE == 0)
    }
}

/// Stored page range row: a written interval and the bytes backing it.
///
/// The chunks are laid end to end and always add up to the range length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRangeModel {
    /// Start byte offset (inclusive). Unique per blob, so it doubles as the row id.
    pub start: u64,
    /// End byte offset (inclusive).
    pub end: u64,
    /// Backing data for `start..=end`.
    pub extent_chunks: Vec<ExtentChunk>,
}

impl PageRangeModel {
    pub fn new(start: u64, end: u64, extent_chunks: Vec<ExtentChunk>) -> Self {
        Self {
            start,
            end,
            extent_chunks,
        }
    }

    pub fn range(&self) -> PageRange {
        PageRange::new(self.start, self.end)
    }
}

/// Page blob constants.
pub const PAGE_SIZE: u64 = 512;
pub const MAX_PAGE_BLOB_SIZE: u64 = 8 * 1024 * 1024 * 1024 * 1024; // 8 TiB
pub const MAX_PAGE_RANGE_SIZE: u64 = 4 * 1024 * 1024; // 4 MiB per write operation
