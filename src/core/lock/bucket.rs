//! Per-bucket locks of the node hash table
//!
//! Buckets are always acquired in strictly increasing index order. Two-key
//! operations lock the lower index first and collapse to a single acquisition
//! when both keys hash to the same bucket. A third bucket discovered while
//! two are held may only be taken if [`force_acquire_allowed`] says so.

use crate::core::kcb::name::ConvKey;
use crossbeam::utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether `new` may be locked on top of the `held` buckets without breaking
/// the total order
pub fn force_acquire_allowed(held: &[usize], new: usize) -> bool {
    held.iter().all(|&index| new > index)
}

pub struct BucketLocks<T> {
    buckets: Box<[RwLock<T>]>,
    acquisitions: CachePadded<AtomicU64>,
}

impl<T: Default> BucketLocks<T> {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "bucket table needs at least one bucket");
        let buckets = (0..count).map(|_| RwLock::new(T::default())).collect();
        BucketLocks {
            buckets,
            acquisitions: CachePadded::new(AtomicU64::new(0)),
        }
    }
}

impl<T> BucketLocks<T> {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn index_of(&self, key: ConvKey) -> usize {
        key.bucket_index(self.buckets.len())
    }

    /// Total bucket acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn count(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_shared(&self, key: ConvKey) -> RwLockReadGuard<'_, T> {
        self.lock_shared_by_index(self.index_of(key))
    }

    pub fn lock_exclusive(&self, key: ConvKey) -> RwLockWriteGuard<'_, T> {
        self.lock_exclusive_by_index(self.index_of(key))
    }

    pub fn lock_shared_by_index(&self, index: usize) -> RwLockReadGuard<'_, T> {
        self.count();
        self.buckets[index].read()
    }

    pub fn lock_exclusive_by_index(&self, index: usize) -> RwLockWriteGuard<'_, T> {
        self.count();
        self.buckets[index].write()
    }

    pub fn try_lock_exclusive_by_index(&self, index: usize) -> Option<RwLockWriteGuard<'_, T>> {
        let guard = self.buckets[index].try_write()?;
        self.count();
        Some(guard)
    }

    /// Lock the buckets of two keys exclusively, lower index first
    pub fn lock_two_exclusive(&self, first: ConvKey, second: ConvKey) -> TwoBucketsExclusive<'_, T> {
        let (low, high) = ordered(self.index_of(first), self.index_of(second));
        let low_guard = self.lock_exclusive_by_index(low);
        let high_guard = high.map(|index| (index, self.lock_exclusive_by_index(index)));
        TwoBucketsExclusive {
            high: high_guard,
            low: (low, low_guard),
        }
    }

    /// Lock the buckets of two keys shared, lower index first
    pub fn lock_two_shared(&self, first: ConvKey, second: ConvKey) -> TwoBucketsShared<'_, T> {
        let (low, high) = ordered(self.index_of(first), self.index_of(second));
        let low_guard = self.lock_shared_by_index(low);
        let high_guard = high.map(|index| (index, self.lock_shared_by_index(index)));
        TwoBucketsShared {
            high: high_guard,
            low: (low, low_guard),
        }
    }

    /// Run `f` on every bucket, one exclusive lock at a time in index order
    pub fn for_each_exclusive(&self, mut f: impl FnMut(usize, &mut T)) {
        for index in 0..self.buckets.len() {
            let mut guard = self.lock_exclusive_by_index(index);
            f(index, &mut guard);
        }
    }

    /// Run `f` on every bucket, one shared lock at a time in index order
    pub fn for_each_shared(&self, mut f: impl FnMut(usize, &T)) {
        for index in 0..self.buckets.len() {
            let guard = self.lock_shared_by_index(index);
            f(index, &guard);
        }
    }
}

fn ordered(a: usize, b: usize) -> (usize, Option<usize>) {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => (a, Some(b)),
        std::cmp::Ordering::Greater => (b, Some(a)),
        std::cmp::Ordering::Equal => (a, None),
    }
}

/// Exclusive hold on one or two buckets.
///
/// Fields drop in declaration order, so the higher bucket is released first.
pub struct TwoBucketsExclusive<'a, T> {
    high: Option<(usize, RwLockWriteGuard<'a, T>)>,
    low: (usize, RwLockWriteGuard<'a, T>),
}

impl<'a, T> TwoBucketsExclusive<'a, T> {
    /// Bucket indices in acquisition order
    pub fn acquired(&self) -> Vec<usize> {
        let mut indices = vec![self.low.0];
        indices.extend(self.high.as_ref().map(|(index, _)| *index));
        indices
    }

    pub fn holds(&self, index: usize) -> bool {
        self.low.0 == index || self.high.as_ref().is_some_and(|(i, _)| *i == index)
    }

    pub fn bucket(&self, index: usize) -> &T {
        if self.low.0 == index {
            return &self.low.1;
        }
        match &self.high {
            Some((i, guard)) if *i == index => guard,
            _ => panic!("bucket {} is not held", index),
        }
    }

    pub fn bucket_mut(&mut self, index: usize) -> &mut T {
        if self.low.0 == index {
            return &mut self.low.1;
        }
        match &mut self.high {
            Some((i, guard)) if *i == index => guard,
            _ => panic!("bucket {} is not held", index),
        }
    }
}

/// Shared hold on one or two buckets
pub struct TwoBucketsShared<'a, T> {
    high: Option<(usize, RwLockReadGuard<'a, T>)>,
    low: (usize, RwLockReadGuard<'a, T>),
}

impl<'a, T> TwoBucketsShared<'a, T> {
    /// Bucket indices in acquisition order
    pub fn acquired(&self) -> Vec<usize> {
        let mut indices = vec![self.low.0];
        indices.extend(self.high.as_ref().map(|(index, _)| *index));
        indices
    }

    pub fn bucket(&self, index: usize) -> &T {
        if self.low.0 == index {
            return &self.low.1;
        }
        match &self.high {
            Some((i, guard)) if *i == index => guard,
            _ => panic!("bucket {} is not held", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_in_distinct_buckets(locks: &BucketLocks<u32>) -> (ConvKey, ConvKey) {
        let first = ConvKey(1);
        let second = (2..)
            .map(ConvKey)
            .find(|k| locks.index_of(*k) != locks.index_of(first))
            .unwrap();
        (first, second)
    }

    #[test]
    fn test_two_buckets_lower_first() {
        let locks: BucketLocks<u32> = BucketLocks::new(64);
        let (a, b) = keys_in_distinct_buckets(&locks);

        let guard = locks.lock_two_exclusive(a, b);
        let order = guard.acquired();
        assert_eq!(order.len(), 2);
        assert!(order[0] < order[1]);
        drop(guard);

        let guard = locks.lock_two_exclusive(b, a);
        let reversed = guard.acquired();
        assert_eq!(order, reversed);
    }

    #[test]
    fn test_same_bucket_single_acquisition() {
        let locks: BucketLocks<u32> = BucketLocks::new(16);
        let key = ConvKey(42);

        let before = locks.acquisitions();
        let mut guard = locks.lock_two_exclusive(key, key);
        assert_eq!(locks.acquisitions() - before, 1);
        assert_eq!(guard.acquired().len(), 1);

        *guard.bucket_mut(locks.index_of(key)) += 1;
        drop(guard);
        assert_eq!(*locks.lock_shared(key), 1);
    }

    #[test]
    fn test_held_buckets_refuse_try_lock() {
        let locks: BucketLocks<u32> = BucketLocks::new(64);
        let (a, b) = keys_in_distinct_buckets(&locks);

        let guard = locks.lock_two_exclusive(a, b);
        assert!(locks.try_lock_exclusive_by_index(locks.index_of(a)).is_none());
        assert!(locks.try_lock_exclusive_by_index(locks.index_of(b)).is_none());
        drop(guard);
        assert!(locks.try_lock_exclusive_by_index(locks.index_of(a)).is_some());
    }

    #[test]
    fn test_two_shared_coexist() {
        let locks: BucketLocks<u32> = BucketLocks::new(8);
        let (a, b) = keys_in_distinct_buckets(&locks);

        let first = locks.lock_two_shared(a, b);
        let second = locks.lock_two_shared(b, a);
        assert_eq!(first.acquired(), second.acquired());
        assert_eq!(*first.bucket(locks.index_of(a)), 0);
    }

    #[test]
    fn test_force_acquire_predicate() {
        assert!(force_acquire_allowed(&[3, 7], 8));
        assert!(!force_acquire_allowed(&[3, 7], 7));
        assert!(!force_acquire_allowed(&[3, 7], 5));
        assert!(force_acquire_allowed(&[], 0));
    }
}
