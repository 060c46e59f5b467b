//! Chunked transfer ranges
//!
//! Splits a transfer of `len` bytes into consecutive ranges no wider than the
//! transport's maximum block size. Shared by NV storage access and by log
//! message emission over the BLE attribute ceiling.

use core::ops::Range;

/// Iterator over block-sized ranges of a transfer.
///
/// Yields `0..max_block`, `max_block..2*max_block`, ... with the final range
/// holding the remainder. A zero-length transfer yields nothing.
#[derive(Debug, Clone)]
pub struct Chunks {
    offset: usize,
    len: usize,
    max_block: usize,
}

impl Chunks {
    /// Create a chunk iterator. A `max_block` of 0 is treated as 1.
    pub fn new(len: usize, max_block: usize) -> Self {
        Self {
            offset: 0,
            len,
            max_block: max_block.max(1),
        }
    }
}

impl Iterator for Chunks {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.len {
            return None;
        }

        let start = self.offset;
        let end = (start + self.max_block).min(self.len);
        self.offset = end;
        Some(start..end)
    }
}

/// Split a transfer of `len` bytes into ranges of at most `max_block` bytes.
pub fn chunks(len: usize, max_block: usize) -> Chunks {
    Chunks::new(len, max_block)
}
