//! Extent release for hive storage
//!
//! Two walks over a storage space's extent map:
//! - [`release_all`] tears down every bin of a hive being unloaded
//! - [`release_suffix`] shrinks one space back to a boundary cell
//!
//! Both expect the caller to hold the hive mutation lock exclusively for the
//! whole call; they are always one step of a larger teardown or shrink.

pub mod quota;

use crate::core::hive::{
    CellIndex, HiveId, HiveStorage, MapEntry, Storage, StorageKind, HBLOCK_SIZE, HSECTOR_SIZE,
};
use ahash::AHashMap;
use parking_lot::Mutex;
use quota::QuotaPool;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Observer of hive size changes
///
/// Notified after a stable space has been shrunk so that grow/shrink
/// decisions can apply hysteresis instead of reacting to every change.
pub trait SizeTracker: Send + Sync {
    fn hive_shrunk(&self, hive: HiveId, old_length: u32, new_length: u32);
}

/// Per-hive shrink accounting with a trim threshold
pub struct HiveHysteresis {
    threshold: u64,
    pending: Mutex<AHashMap<HiveId, u64>>,
    trims: AtomicU64,
}

impl HiveHysteresis {
    /// Default: trim once a hive has shrunk by 16 blocks
    pub const DEFAULT_THRESHOLD: u64 = 16 * HBLOCK_SIZE as u64;

    pub fn new(threshold: u64) -> Self {
        HiveHysteresis {
            threshold,
            pending: Mutex::new(AHashMap::new()),
            trims: AtomicU64::new(0),
        }
    }

    /// Bytes shrunk since the hive's last trim
    pub fn pending_bytes(&self, hive: HiveId) -> u64 {
        self.pending.lock().get(&hive).copied().unwrap_or(0)
    }

    /// Number of times the threshold was crossed
    pub fn trim_count(&self) -> u64 {
        self.trims.load(Ordering::Relaxed)
    }
}

impl Default for HiveHysteresis {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl SizeTracker for HiveHysteresis {
    fn hive_shrunk(&self, hive: HiveId, old_length: u32, new_length: u32) {
        let shrunk = old_length.saturating_sub(new_length) as u64;
        let mut pending = self.pending.lock();
        let total = pending.entry(hive).or_insert(0);
        *total += shrunk;
        if *total >= self.threshold {
            debug!(hive = %hive, bytes = *total, "shrink threshold crossed");
            *total = 0;
            self.trims.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// What one walk released
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTally {
    /// Live bins whose memory was released
    pub bins: u32,
    /// Tombstones consumed
    pub tombstones: u32,
    /// Mapped blocks skipped
    pub mapped_blocks: u32,
    /// Quota returned to the pool
    pub credited: u64,
}

enum Step {
    Tombstone,
    Resident,
    Mapped,
}

/// Walk `[start, end)` of one space, releasing every extent in it.
///
/// With `unlink`, consumed tombstones are removed from the free list.
fn release_range(
    hive: HiveId,
    space: &mut Storage,
    start: u32,
    end: u32,
    quota: &QuotaPool,
    unlink: bool,
) -> ReleaseTally {
    let mut tally = ReleaseTally::default();
    let mut offset = start;

    while offset < end {
        let block = offset / HBLOCK_SIZE;
        let step = match space.map.get(block) {
            Some(MapEntry::Discardable { bin_start }) if *bin_start == offset => Step::Tombstone,
            Some(MapEntry::Allocated {
                bin_start,
                memory: Some(_),
            }) if *bin_start == offset => Step::Resident,
            Some(MapEntry::Mapped { .. }) => Step::Mapped,
            other => panic!(
                "{}: corrupt extent map in {:?} space at {:#x}: {:?}",
                hive,
                space.kind(),
                offset,
                other
            ),
        };

        match step {
            Step::Tombstone => {
                let (size, memory) = if unlink {
                    let Some(bin) = space.free_bins.remove(&offset) else {
                        panic!("{}: discardable extent at {:#x} has no tombstone", hive, offset);
                    };
                    (bin.size, bin.memory)
                } else {
                    let Some(bin) = space.free_bins.get_mut(&offset) else {
                        panic!("{}: discardable extent at {:#x} has no tombstone", hive, offset);
                    };
                    bin.discarded = true;
                    (bin.size, bin.memory.take())
                };
                if let Some(memory) = memory {
                    quota.release_memory(memory);
                }
                // charged whether or not the memory was already discarded
                quota.credit(size as u64);
                tally.tombstones += 1;
                tally.credited += size as u64;
                offset += size;
            }
            Step::Resident => {
                let memory = match space.map.get_mut(block) {
                    Some(MapEntry::Allocated { memory, .. }) => memory.take(),
                    _ => None,
                };
                let Some(memory) = memory else {
                    panic!("{}: resident extent at {:#x} lost its memory", hive, offset);
                };
                let size = quota.release_memory(memory);
                quota.credit(size as u64);
                tally.bins += 1;
                tally.credited += size as u64;
                offset += size;
            }
            Step::Mapped => {
                tally.mapped_blocks += 1;
                offset += HBLOCK_SIZE;
            }
        }
    }

    tally
}

/// Release every extent of a hive, its map tables, its base descriptor
/// and its dirty vector. The `HiveStorage` itself stays for the caller.
pub fn release_all(hive: HiveId, storage: &mut HiveStorage, quota: &QuotaPool) {
    let mut total = ReleaseTally::default();

    for kind in StorageKind::ALL {
        let space = storage.space_mut(kind);
        if !space.is_empty() {
            let end = space.length_bytes();
            let tally = release_range(hive, space, 0, end, quota, false);
            total.bins += tally.bins;
            total.tombstones += tally.tombstones;
            total.mapped_blocks += tally.mapped_blocks;
            total.credited += tally.credited;
        }
        space.map.free_all();
        // every tombstone was credited above
        space.free_bins.clear();
        space.set_length_bytes(0);

        if kind == StorageKind::Stable {
            storage.dirty.clear_all();
        }
    }

    storage.base = None;
    storage.dirty.release();

    info!(
        hive = %hive,
        bins = total.bins,
        tombstones = total.tombstones,
        mapped_blocks = total.mapped_blocks,
        credited = total.credited,
        "hive storage released"
    );
}

/// Release `[start, length)` of one space and truncate it to `start`.
///
/// `start` must be a bin boundary. A no-op when it already equals the
/// recorded length.
pub fn release_suffix(
    hive: HiveId,
    storage: &mut HiveStorage,
    start: CellIndex,
    kind: StorageKind,
    quota: &QuotaPool,
    tracker: &dyn SizeTracker,
) {
    assert_eq!(
        start.kind(),
        kind,
        "{}: shrink boundary {:?} is not in the {:?} space",
        hive,
        start,
        kind
    );

    let space = storage.space_mut(kind);
    let old_length = space.length_bytes();
    let boundary = start.offset();
    if boundary == old_length {
        trace!(hive = %hive, ?kind, "shrink boundary equals length");
        return;
    }
    assert!(
        boundary < old_length,
        "{}: shrink boundary {:#x} beyond length {:#x}",
        hive,
        boundary,
        old_length
    );

    let tally = release_range(hive, space, boundary, old_length, quota, true);

    let new_length = boundary - boundary % HBLOCK_SIZE;
    space.set_length_bytes(new_length);
    space.map.truncate(new_length / HBLOCK_SIZE);

    if kind == StorageKind::Stable {
        let first_bit = (boundary / HSECTOR_SIZE) as usize;
        let total_bits = storage.dirty.total_bits();
        storage.dirty.clear_bits(first_bit, total_bits);
        storage.dirty.recount();
        tracker.hive_shrunk(hive, old_length, new_length);
    }

    debug!(
        hive = %hive,
        ?kind,
        old_length,
        new_length,
        bins = tally.bins,
        tombstones = tally.tombstones,
        "storage shrunk"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hive::{Hive, HiveSpec};
    use std::sync::Arc;

    fn hive_with_bins(pool: &Arc<QuotaPool>, bins: u32) -> (Hive, Vec<CellIndex>) {
        let hive = Hive::create(HiveId(1), "\\test", &HiveSpec::new("TEST"), pool.clone()).unwrap();
        let cells = (0..bins)
            .map(|_| hive.allocate_bin(StorageKind::Stable, HBLOCK_SIZE).unwrap())
            .collect();
        (hive, cells)
    }

    #[test]
    fn test_release_all_returns_quota_and_memory() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let (hive, cells) = hive_with_bins(&pool, 4);
        hive.allocate_bin(StorageKind::Volatile, 2 * HBLOCK_SIZE).unwrap();
        hive.free_bin(cells[1]).unwrap();
        hive.free_bin(cells[2]).unwrap();
        hive.discard_free_bins();

        {
            let mut storage = hive.storage_mut();
            release_all(hive.id(), &mut storage, &pool);
            assert!(storage.base().is_none());
            assert!(!storage.dirty().is_allocated());
            assert_eq!(storage.space(StorageKind::Stable).map().table_count(), 0);
            assert_eq!(storage.space(StorageKind::Volatile).map().table_count(), 0);
            for kind in StorageKind::ALL {
                assert_eq!(storage.space(kind).free_bin_count(), 0);
                assert!(storage.space(kind).is_empty());
            }
        }
        assert_eq!(pool.charged(), 0);
        assert_eq!(pool.resident(), 0);
    }

    #[test]
    fn test_release_all_skips_mapped_blocks() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let spec = HiveSpec::new("MAPPED").with_mapped_blocks(3);
        let hive = Hive::create(HiveId(2), "\\mapped", &spec, pool.clone()).unwrap();
        let charged = pool.charged();
        assert_eq!(charged, HBLOCK_SIZE as u64);

        let mut storage = hive.storage_mut();
        release_all(hive.id(), &mut storage, &pool);
        assert_eq!(pool.charged(), 0);
    }

    #[test]
    fn test_release_suffix_unlinks_tombstones() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let tracker = HiveHysteresis::new(u64::MAX);
        let (hive, cells) = hive_with_bins(&pool, 3);
        hive.free_bin(cells[2]).unwrap();
        let before = pool.charged();

        hive.shrink(StorageKind::Stable, cells[1], &tracker).unwrap();

        let storage = hive.storage();
        let stable = storage.space(StorageKind::Stable);
        assert_eq!(stable.length_bytes(), cells[1].offset());
        assert_eq!(stable.free_bin_count(), 0);
        assert_eq!(before - pool.charged(), 2 * HBLOCK_SIZE as u64);
        assert_eq!(
            tracker.pending_bytes(hive.id()),
            2 * HBLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_release_suffix_clears_dirty_tail() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let tracker = HiveHysteresis::default();
        let (hive, cells) = hive_with_bins(&pool, 2);

        hive.shrink(StorageKind::Stable, cells[0], &tracker).unwrap();

        let storage = hive.storage();
        let first_cut = (cells[0].offset() / HSECTOR_SIZE) as usize;
        assert!(!storage.dirty().is_dirty(first_cut));
        assert!(storage.dirty().is_dirty(first_cut - 1));
        assert_eq!(storage.dirty().dirty_count(), first_cut);
    }

    #[test]
    fn test_release_suffix_volatile_empty() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let tracker = HiveHysteresis::default();
        let (hive, _) = hive_with_bins(&pool, 0);
        let cell = hive.allocate_bin(StorageKind::Volatile, HBLOCK_SIZE).unwrap();

        hive.shrink(StorageKind::Volatile, cell, &tracker).unwrap();

        let storage = hive.storage();
        let volatile = storage.space(StorageKind::Volatile);
        assert!(volatile.is_empty());
        assert_eq!(volatile.length(), StorageKind::Volatile.base());
        // volatile shrink does not report to the tracker
        assert_eq!(tracker.pending_bytes(hive.id()), 0);
    }

    #[test]
    #[should_panic(expected = "corrupt extent map")]
    fn test_release_suffix_mid_bin_is_fatal() {
        let pool = Arc::new(QuotaPool::new(1 << 22));
        let tracker = HiveHysteresis::default();
        let hive = Hive::create(HiveId(3), "\\t", &HiveSpec::new("T"), pool.clone()).unwrap();
        let cell = hive.allocate_bin(StorageKind::Stable, 2 * HBLOCK_SIZE).unwrap();
        let interior = CellIndex::new(StorageKind::Stable, cell.offset() + HBLOCK_SIZE);

        let mut storage = hive.storage_mut();
        release_suffix(hive.id(), &mut storage, interior, StorageKind::Stable, &pool, &tracker);
    }

    #[test]
    fn test_hysteresis_threshold() {
        let tracker = HiveHysteresis::new(3 * HBLOCK_SIZE as u64);
        let hive = HiveId(9);

        tracker.hive_shrunk(hive, 4 * HBLOCK_SIZE, 2 * HBLOCK_SIZE);
        assert_eq!(tracker.trim_count(), 0);
        assert_eq!(tracker.pending_bytes(hive), 2 * HBLOCK_SIZE as u64);

        tracker.hive_shrunk(hive, 2 * HBLOCK_SIZE, HBLOCK_SIZE);
        assert_eq!(tracker.trim_count(), 1);
        assert_eq!(tracker.pending_bytes(hive), 0);
    }
}
