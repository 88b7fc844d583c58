//! Storage shrink and teardown accounting
//!
//! Shrinking a space back to a bin boundary must return exactly the quota
//! charged for the bins past it, tombstones included, and must be a no-op
//! when repeated.

use hivecore::core::hive::{HBLOCK_SIZE, HSECTOR_SIZE};
use hivecore::{
    CellIndex, Hive, HiveError, HiveHysteresis, HiveId, HiveSpec, QuotaPool, SizeTracker,
    StorageKind,
};
use proptest::prelude::*;
use std::sync::Arc;

const QUOTA: u64 = 1 << 26;

fn hive(spec: &HiveSpec) -> (Hive, Arc<QuotaPool>) {
    let pool = Arc::new(QuotaPool::new(QUOTA));
    let hive = Hive::create(HiveId(7), "\\registry\\t", spec, pool.clone()).unwrap();
    (hive, pool)
}

/// Allocate `sizes` (in blocks) and record the charge before each bin
fn allocate(hive: &Hive, pool: &QuotaPool, sizes: &[u32]) -> Vec<(CellIndex, u64)> {
    sizes
        .iter()
        .map(|blocks| {
            let before = pool.charged();
            let cell = hive
                .allocate_bin(StorageKind::Stable, blocks * HBLOCK_SIZE)
                .unwrap();
            (cell, before)
        })
        .collect()
}

fn assert_clean_tail(hive: &Hive, boundary: u32) {
    let storage = hive.storage();
    let dirty = storage.dirty();
    let first = (boundary / HSECTOR_SIZE) as usize;
    for bit in first..dirty.total_bits() {
        assert!(!dirty.is_dirty(bit), "sector {} dirty past {:#x}", bit, boundary);
    }
}

proptest! {
    #[test]
    fn prop_shrink_returns_tail_charge(
        sizes in prop::collection::vec(1u32..4, 1..16),
        cut in any::<prop::sample::Index>(),
        freed in prop::collection::vec(any::<bool>(), 16),
        discard in any::<bool>(),
    ) {
        let (hive, pool) = hive(&HiveSpec::new("T"));
        let bins = allocate(&hive, &pool, &sizes);
        for ((cell, _), free) in bins.iter().zip(&freed) {
            if *free {
                hive.free_bin(*cell).unwrap();
            }
        }
        if discard {
            hive.discard_free_bins();
        }

        let (boundary, charged_before) = bins[cut.index(bins.len())];
        let tracker = HiveHysteresis::new(u64::MAX);
        hive.shrink(StorageKind::Stable, boundary, &tracker).unwrap();

        prop_assert_eq!(pool.charged(), charged_before);
        prop_assert!(pool.resident() <= pool.charged());
        if !discard {
            prop_assert_eq!(pool.resident(), pool.charged());
        }
        prop_assert_eq!(
            hive.storage().space(StorageKind::Stable).length_bytes(),
            boundary.offset()
        );
        let tail_free = hive
            .storage()
            .space(StorageKind::Stable)
            .free_bins()
            .filter(|bin| bin.offset >= boundary.offset())
            .count();
        prop_assert_eq!(tail_free, 0);
        assert_clean_tail(&hive, boundary.offset());

        // a second shrink to the same boundary changes nothing
        let charged = pool.charged();
        hive.shrink(StorageKind::Stable, boundary, &tracker).unwrap();
        prop_assert_eq!(pool.charged(), charged);
    }
}

#[test]
fn test_shrink_first_middle_last() {
    let sizes = [1, 2, 1, 3, 1];
    for cut in [0, sizes.len() / 2, sizes.len() - 1] {
        let (hive, pool) = hive(&HiveSpec::new("T"));
        let baseline = pool.charged();
        let bins = allocate(&hive, &pool, &sizes);
        let (boundary, before) = bins[cut];

        hive.shrink(StorageKind::Stable, boundary, &HiveHysteresis::default()).unwrap();
        assert_eq!(pool.charged(), before, "cut at bin {}", cut);
        assert_eq!(
            hive.storage().space(StorageKind::Stable).length_bytes(),
            boundary.offset()
        );

        // growing again reuses the same offsets
        let regrown = allocate(&hive, &pool, &sizes[cut..]);
        assert_eq!(regrown[0].0, boundary);
        hive.shrink(StorageKind::Stable, boundary, &HiveHysteresis::default()).unwrap();
        assert_eq!(pool.charged(), before);
        assert!(pool.charged() >= baseline);
    }
}

#[test]
fn test_shrink_skips_mapped_blocks() {
    let (hive, pool) = hive(&HiveSpec::new("T").with_mapped_blocks(2));
    let mapped_start = CellIndex::new(StorageKind::Stable, HBLOCK_SIZE);
    let before = pool.charged();
    let resident = pool.resident();
    allocate(&hive, &pool, &[1, 1]);

    hive.shrink(StorageKind::Stable, mapped_start, &HiveHysteresis::default()).unwrap();
    assert_eq!(pool.charged(), before);
    assert_eq!(pool.resident(), resident);
    assert_eq!(
        hive.storage().space(StorageKind::Stable).length_bytes(),
        HBLOCK_SIZE
    );
}

#[test]
fn test_volatile_shrink_leaves_dirty_vector() {
    let (hive, pool) = hive(&HiveSpec::new("T"));
    let dirty = hive.storage().dirty().dirty_count();
    let first = hive.allocate_bin(StorageKind::Volatile, HBLOCK_SIZE).unwrap();
    hive.allocate_bin(StorageKind::Volatile, HBLOCK_SIZE).unwrap();
    let charged = pool.charged();

    let tracker = HiveHysteresis::new(1);
    hive.shrink(StorageKind::Volatile, first, &tracker).unwrap();
    assert_eq!(pool.charged(), charged - 2 * HBLOCK_SIZE as u64);
    assert_eq!(hive.storage().dirty().dirty_count(), dirty);
    // only stable shrinks are reported
    assert_eq!(tracker.trim_count(), 0);
}

#[test]
fn test_hysteresis_counts_shrunk_bytes() {
    let (hive, pool) = hive(&HiveSpec::new("T"));
    let bins = allocate(&hive, &pool, &[1, 1, 1, 1]);
    let tracker = HiveHysteresis::new(3 * HBLOCK_SIZE as u64);

    hive.shrink(StorageKind::Stable, bins[2].0, &tracker).unwrap();
    assert_eq!(tracker.pending_bytes(HiveId(7)), 2 * HBLOCK_SIZE as u64);
    assert_eq!(tracker.trim_count(), 0);

    hive.shrink(StorageKind::Stable, bins[1].0, &tracker).unwrap();
    assert_eq!(tracker.pending_bytes(HiveId(7)), 0);
    assert_eq!(tracker.trim_count(), 1);
}

#[test]
fn test_custom_tracker_sees_lengths() {
    struct Last(parking_lot::Mutex<Option<(u32, u32)>>);
    impl SizeTracker for Last {
        fn hive_shrunk(&self, _hive: HiveId, old: u32, new: u32) {
            *self.0.lock() = Some((old, new));
        }
    }

    let (hive, pool) = hive(&HiveSpec::new("T"));
    let bins = allocate(&hive, &pool, &[2]);
    let tracker = Last(parking_lot::Mutex::new(None));
    hive.shrink(StorageKind::Stable, bins[0].0, &tracker).unwrap();
    assert_eq!(*tracker.0.lock(), Some((3 * HBLOCK_SIZE, HBLOCK_SIZE)));
}

#[test]
fn test_shrink_rejects_bad_boundaries() {
    let (hive, pool) = hive(&HiveSpec::new("T"));
    let bins = allocate(&hive, &pool, &[2]);
    let charged = pool.charged();
    let length = hive.storage().space(StorageKind::Stable).length_bytes();
    let tracker = HiveHysteresis::default();

    let past = CellIndex::new(StorageKind::Stable, 8 * HBLOCK_SIZE);
    let inside = CellIndex::new(StorageKind::Stable, bins[0].0.offset() + HBLOCK_SIZE);
    let unaligned = CellIndex::new(StorageKind::Stable, bins[0].0.offset() + 8);
    for start in [past, inside, unaligned] {
        assert!(matches!(
            hive.shrink(StorageKind::Stable, start, &tracker),
            Err(HiveError::InvalidCell(cell)) if cell == start
        ));
    }
    // a stable cell named as the volatile boundary
    assert!(matches!(
        hive.shrink(StorageKind::Volatile, bins[0].0, &tracker),
        Err(HiveError::InvalidCell(_))
    ));

    assert_eq!(pool.charged(), charged);
    assert_eq!(
        hive.storage().space(StorageKind::Stable).length_bytes(),
        length
    );
}

#[test]
fn test_shrink_refuses_to_cut_live_keys() {
    let (hive, pool) = hive(&HiveSpec::new("T").with_keys(["a", "b"]));
    let a = hive.lookup_key("a").unwrap().cell;
    let b = hive.lookup_key("b").unwrap().cell;
    let charged = pool.charged();
    let tracker = HiveHysteresis::default();

    for start in [a, b] {
        assert!(matches!(
            hive.shrink(StorageKind::Stable, start, &tracker),
            Err(HiveError::InvalidCell(_))
        ));
    }
    assert_eq!(pool.charged(), charged);
    assert_eq!(hive.lookup_key("b").map(|r| r.cell), Some(b));

    // once b is gone its bin can be cut, and a new key gets a fresh offset
    hive.remove_key("b").unwrap();
    hive.shrink(StorageKind::Stable, b, &tracker).unwrap();
    assert_eq!(
        hive.storage().space(StorageKind::Stable).length_bytes(),
        b.offset()
    );
    let c = hive.add_key("c".into(), "c", StorageKind::Stable).unwrap();
    assert_eq!(c, b);
    assert_ne!(c, a);
    assert_eq!(hive.lookup_key("a").map(|r| r.cell), Some(a));
}

#[test]
fn test_failed_key_removal_keeps_index() {
    let (hive, _pool) = hive(&HiveSpec::new("T").with_keys(["a"]));
    let a = hive.lookup_key("a").unwrap().cell;
    hive.free_bin(a).unwrap();

    // the bin is already a tombstone, so removal fails and the key stays
    assert!(matches!(hive.remove_key("a"), Err(HiveError::InvalidCell(_))));
    assert_eq!(hive.lookup_key("a").map(|r| r.cell), Some(a));
}
