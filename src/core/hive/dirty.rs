//! Dirty-sector bitmap for the stable storage space
//!
//! One bit per [`HSECTOR_SIZE`] bytes of stable storage:
//! - 0 = clean sector
//! - 1 = sector modified since the last flush

use crate::core::hive::cell::HSECTOR_SIZE;

#[derive(Debug, Clone, Default)]
pub struct DirtyVector {
    /// Bitmap words (each word = 64 sectors); `None` once the buffer is released
    bits: Option<Vec<u64>>,

    /// Number of sectors tracked
    total_bits: usize,

    /// Cached number of set bits
    dirty_count: usize,
}

impl DirtyVector {
    pub fn new() -> Self {
        DirtyVector {
            bits: Some(Vec::new()),
            total_bits: 0,
            dirty_count: 0,
        }
    }

    /// Grow the vector to cover `length` bytes of stable storage.
    /// New sectors start clean.
    pub fn grow_to_cover(&mut self, length: u32) {
        let needed = length.div_ceil(HSECTOR_SIZE) as usize;
        if needed <= self.total_bits {
            return;
        }
        let bits = self.bits.get_or_insert_with(Vec::new);
        bits.resize(needed.div_ceil(64), 0u64);
        self.total_bits = needed;
    }

    /// Mark bytes `[offset, offset + len)` dirty
    pub fn mark_range(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        self.grow_to_cover(offset + len);
        let first = (offset / HSECTOR_SIZE) as usize;
        let last = ((offset + len - 1) / HSECTOR_SIZE) as usize;
        let Some(bits) = self.bits.as_mut() else {
            return;
        };
        for bit in first..=last {
            let word = &mut bits[bit / 64];
            let mask = 1u64 << (bit % 64);
            if *word & mask == 0 {
                *word |= mask;
                self.dirty_count += 1;
            }
        }
    }

    /// Clear bits `[start_bit, end_bit)`
    pub fn clear_bits(&mut self, start_bit: usize, end_bit: usize) {
        let end_bit = end_bit.min(self.total_bits);
        let Some(bits) = self.bits.as_mut() else {
            return;
        };
        for bit in start_bit..end_bit {
            bits[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    /// Recompute the cached dirty count from the bitmap
    pub fn recount(&mut self) -> usize {
        self.dirty_count = self
            .bits
            .as_ref()
            .map(|bits| bits.iter().map(|w| w.count_ones() as usize).sum())
            .unwrap_or(0);
        self.dirty_count
    }

    pub fn clear_all(&mut self) {
        if let Some(bits) = self.bits.as_mut() {
            bits.iter_mut().for_each(|w| *w = 0);
        }
        self.dirty_count = 0;
    }

    /// Drop the backing buffer
    pub fn release(&mut self) {
        self.bits = None;
        self.total_bits = 0;
        self.dirty_count = 0;
    }

    pub fn is_dirty(&self, bit: usize) -> bool {
        if bit >= self.total_bits {
            return false;
        }
        self.bits
            .as_ref()
            .map(|bits| bits[bit / 64] & (1u64 << (bit % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    pub fn total_bits(&self) -> usize {
        self.total_bits
    }

    pub fn is_allocated(&self) -> bool {
        self.bits.is_some()
    }
}
