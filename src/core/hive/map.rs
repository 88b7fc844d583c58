//! Extent map: block number -> bin location
//!
//! Two-level structure. A directory of lazily allocated tables, each table
//! covering [`HTABLE_SLOTS`] blocks. A table exists only while at least one
//! of its slots references an extent.

use crate::core::allocator::quota::BinMemory;
use crate::core::hive::cell::HTABLE_SLOTS;

/// State of one block in a storage space
#[derive(Debug, Default)]
pub enum MapEntry {
    /// Beyond the end of the space
    #[default]
    Unused,
    /// Part of a live bin resident in memory.
    /// `memory` is present only on the first block of the allocation.
    Allocated {
        bin_start: u32,
        memory: Option<BinMemory>,
    },
    /// Part of a bin backed by a mapped view; no memory allocation of our own
    Mapped { bin_start: u32 },
    /// Part of a free bin; the tombstone lives in the space's free list
    Discardable { bin_start: u32 },
}

impl MapEntry {
    pub fn bin_start(&self) -> Option<u32> {
        match self {
            MapEntry::Unused => None,
            MapEntry::Allocated { bin_start, .. }
            | MapEntry::Mapped { bin_start }
            | MapEntry::Discardable { bin_start } => Some(*bin_start),
        }
    }

    pub fn is_discardable(&self) -> bool {
        matches!(self, MapEntry::Discardable { .. })
    }
}

#[derive(Debug)]
struct MapTable {
    slots: Box<[MapEntry]>,
    in_use: u32,
}

impl MapTable {
    fn new() -> Self {
        let slots = (0..HTABLE_SLOTS).map(|_| MapEntry::Unused).collect();
        MapTable { slots, in_use: 0 }
    }
}

#[derive(Debug, Default)]
pub struct CellMap {
    directory: Vec<Option<MapTable>>,
}

impl CellMap {
    pub fn new() -> Self {
        CellMap::default()
    }

    fn split(block: u32) -> (usize, usize) {
        (
            (block / HTABLE_SLOTS) as usize,
            (block % HTABLE_SLOTS) as usize,
        )
    }

    pub fn get(&self, block: u32) -> Option<&MapEntry> {
        let (table, slot) = Self::split(block);
        self.directory
            .get(table)
            .and_then(|t| t.as_ref())
            .map(|t| &t.slots[slot])
    }

    pub fn get_mut(&mut self, block: u32) -> Option<&mut MapEntry> {
        let (table, slot) = Self::split(block);
        self.directory
            .get_mut(table)
            .and_then(|t| t.as_mut())
            .map(|t| &mut t.slots[slot])
    }

    /// Store `entry` at `block`, allocating its table on demand.
    /// Returns the previous entry.
    pub fn set(&mut self, block: u32, entry: MapEntry) -> MapEntry {
        let (table, slot) = Self::split(block);
        if self.directory.len() <= table {
            self.directory.resize_with(table + 1, || None);
        }
        let t = self.directory[table].get_or_insert_with(MapTable::new);
        let was_unused = matches!(t.slots[slot], MapEntry::Unused);
        let is_unused = matches!(entry, MapEntry::Unused);
        let previous = std::mem::replace(&mut t.slots[slot], entry);
        match (was_unused, is_unused) {
            (true, false) => t.in_use += 1,
            (false, true) => t.in_use -= 1,
            _ => {}
        }
        if t.in_use == 0 {
            self.directory[table] = None;
        }
        previous
    }

    /// Remove the entry at `block`, releasing its table if it became empty
    pub fn take(&mut self, block: u32) -> MapEntry {
        let (table, _) = Self::split(block);
        match self.directory.get(table) {
            Some(Some(_)) => self.set(block, MapEntry::Unused),
            _ => MapEntry::Unused,
        }
    }

    /// Drop every table covering blocks at or beyond `blocks`.
    /// Slots in the boundary table past the cut are cleared.
    pub fn truncate(&mut self, blocks: u32) {
        let keep_tables = blocks.div_ceil(HTABLE_SLOTS) as usize;
        if self.directory.len() > keep_tables {
            self.directory.truncate(keep_tables);
        }
        if let Some(Some(table)) = self.directory.last_mut() {
            let first_cut = (blocks % HTABLE_SLOTS) as usize;
            if first_cut != 0 {
                for slot in &mut table.slots[first_cut..] {
                    if !matches!(slot, MapEntry::Unused) {
                        *slot = MapEntry::Unused;
                        table.in_use -= 1;
                    }
                }
            }
            if table.in_use == 0 {
                self.directory.pop();
            }
        }
        while matches!(self.directory.last(), Some(None)) {
            self.directory.pop();
        }
    }

    /// Release every table
    pub fn free_all(&mut self) {
        self.directory = Vec::new();
    }

    /// Number of tables currently allocated
    pub fn table_count(&self) -> usize {
        self.directory.iter().filter(|t| t.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_allocated_on_demand() {
        let mut map = CellMap::new();
        assert_eq!(map.table_count(), 0);

        map.set(HTABLE_SLOTS + 3, MapEntry::Mapped { bin_start: 0 });
        assert_eq!(map.table_count(), 1);
        assert!(map.get(3).is_none());
        assert!(matches!(
            map.get(HTABLE_SLOTS + 3),
            Some(MapEntry::Mapped { .. })
        ));
    }

    #[test]
    fn test_take_releases_empty_table() {
        let mut map = CellMap::new();
        map.set(5, MapEntry::Discardable { bin_start: 5 });
        assert_eq!(map.table_count(), 1);

        let entry = map.take(5);
        assert!(entry.is_discardable());
        assert_eq!(map.table_count(), 0);
    }

    #[test]
    fn test_truncate_drops_tail_tables() {
        let mut map = CellMap::new();
        for block in 0..(HTABLE_SLOTS * 2 + 10) {
            map.set(block, MapEntry::Mapped { bin_start: block });
        }
        assert_eq!(map.table_count(), 3);

        map.truncate(HTABLE_SLOTS + 1);
        assert_eq!(map.table_count(), 2);
        assert!(map.get(HTABLE_SLOTS).is_some());
        assert!(matches!(map.get(HTABLE_SLOTS + 1), Some(MapEntry::Unused)));

        map.truncate(HTABLE_SLOTS);
        assert_eq!(map.table_count(), 1);

        map.truncate(0);
        assert_eq!(map.table_count(), 0);
    }
}
