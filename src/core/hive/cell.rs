//! Cell addressing within a hive's storage spaces
//!
//! A cell index is a 32-bit offset whose top bit selects the storage space:
//! stable cells live in `[0, 0x8000_0000)`, volatile cells in
//! `[0x8000_0000, 0xFFFF_FFFF]`. The type bit doubles as the "empty" length
//! of the volatile space.

use std::fmt;

/// Size of one storage block; bins are whole multiples of it
pub const HBLOCK_SIZE: u32 = 4096;

/// Dirty-tracking granularity of the stable space
pub const HSECTOR_SIZE: u32 = 512;

/// Sectors per block
pub const HSECTOR_COUNT: u32 = HBLOCK_SIZE / HSECTOR_SIZE;

/// Type bit separating stable from volatile cell indices
pub const HCELL_TYPE_MASK: u32 = 0x8000_0000;

/// Map entries per extent-map table
pub const HTABLE_SLOTS: u32 = 512;

/// Largest offset a storage space can grow to
pub const HSPACE_LIMIT: u32 = HCELL_TYPE_MASK - HBLOCK_SIZE;

/// Storage space discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKind {
    /// Persisted to the backing file, dirty-tracked
    Stable,
    /// Memory only, discarded on unload
    Volatile,
}

impl StorageKind {
    pub const ALL: [StorageKind; 2] = [StorageKind::Stable, StorageKind::Volatile];

    /// Type-tag boundary of this space; a space whose length equals its base is empty
    pub const fn base(self) -> u32 {
        match self {
            StorageKind::Stable => 0,
            StorageKind::Volatile => HCELL_TYPE_MASK,
        }
    }
}

/// Index of a cell inside a hive
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex(pub u32);

impl CellIndex {
    pub const fn new(kind: StorageKind, offset: u32) -> Self {
        CellIndex(kind.base() | offset)
    }

    pub const fn kind(self) -> StorageKind {
        if self.0 & HCELL_TYPE_MASK != 0 {
            StorageKind::Volatile
        } else {
            StorageKind::Stable
        }
    }

    /// Byte offset within the owning space
    pub const fn offset(self) -> u32 {
        self.0 & !HCELL_TYPE_MASK
    }

    pub const fn block(self) -> u32 {
        self.offset() / HBLOCK_SIZE
    }

    pub const fn is_block_aligned(self) -> bool {
        self.offset() % HBLOCK_SIZE == 0
    }
}

impl fmt::Debug for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let space = match self.kind() {
            StorageKind::Stable => "stable",
            StorageKind::Volatile => "volatile",
        };
        write!(f, "Cell({}:{:#x})", space, self.offset())
    }
}

/// Round a byte size up to whole blocks
pub const fn round_to_blocks(size: u32) -> u32 {
    size.div_ceil(HBLOCK_SIZE) * HBLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_kind_and_offset() {
        let stable = CellIndex::new(StorageKind::Stable, 0x2000);
        assert_eq!(stable.kind(), StorageKind::Stable);
        assert_eq!(stable.offset(), 0x2000);
        assert_eq!(stable.block(), 2);

        let volatile = CellIndex::new(StorageKind::Volatile, 0x1000);
        assert_eq!(volatile.kind(), StorageKind::Volatile);
        assert_eq!(volatile.0, 0x8000_1000);
        assert_eq!(volatile.offset(), 0x1000);
    }

    #[test]
    fn test_round_to_blocks() {
        assert_eq!(round_to_blocks(1), HBLOCK_SIZE);
        assert_eq!(round_to_blocks(HBLOCK_SIZE), HBLOCK_SIZE);
        assert_eq!(round_to_blocks(HBLOCK_SIZE + 1), 2 * HBLOCK_SIZE);
    }

    #[test]
    fn test_debug_format() {
        let cell = CellIndex::new(StorageKind::Volatile, 0x3000);
        assert_eq!(format!("{:?}", cell), "Cell(volatile:0x3000)");
    }
}
