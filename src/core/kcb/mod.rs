//! Key control block cache
//!
//! Every open path is represented by one cached node, shared by all handles
//! on it. Nodes live in a hash table of independently locked buckets and
//! are addressed by [`KcbRef`], a copyable handle carrying the node id and
//! the conversion key that selects its bucket.
//!
//! Reference counts change only while the node's bucket lock is held:
//! increments and non-final decrements may use a shared lock, anything that
//! can take a count to zero (or revive a zero-count node) needs exclusive.
//! A child node holds one reference on its parent.

pub mod delay;
pub mod name;

use crate::core::error::{HiveError, Result};
use crate::core::hive::{CellIndex, Hive, HiveId, HiveState};
use crate::core::key_body::BodyId;
use crate::core::lock::{force_acquire_allowed, BucketLocks};
use ahash::AHashMap;
use crossbeam::utils::CachePadded;
use delay::DelayCloseCache;
use name::ConvKey;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Stable identity of a cached node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KcbId(pub u64);

/// Handle to a cached node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KcbRef {
    pub id: KcbId,
    pub conv_key: ConvKey,
}

/// One cached namespace node
pub struct KeyControlBlock {
    id: KcbId,
    conv_key: ConvKey,
    hive: Weak<Hive>,
    hive_id: HiveId,
    cell: CellIndex,
    /// Canonical full path
    path: String,
    /// Lower-cased path relative to the hive root
    rel_path: String,
    name: String,
    parent: Option<KcbRef>,
    ref_count: AtomicU32,
    deleted: bool,
    no_delay_close: bool,
    /// Count is zero and the node sits in the reuse cache
    delayed: bool,
    hive_root: bool,
    key_bodies: Vec<BodyId>,
}

impl KeyControlBlock {
    fn kcb_ref(&self) -> KcbRef {
        KcbRef {
            id: self.id,
            conv_key: self.conv_key,
        }
    }

    /// Add one reference, failing at `max`. Returns the previous count.
    fn try_increment(&self, max: u32) -> std::result::Result<u32, u32> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current >= max {
                return Err(current);
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return Ok(previous),
                Err(observed) => current = observed,
            }
        }
    }

    /// Drop one reference if that cannot reach zero
    fn try_decrement_above_one(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        while current > 1 {
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    fn info(&self) -> KcbInfo {
        KcbInfo {
            kcb: self.kcb_ref(),
            hive_id: self.hive_id,
            hive: self.hive.clone(),
            cell: self.cell,
            path: self.path.clone(),
            rel_path: self.rel_path.clone(),
            name: self.name.clone(),
            parent: self.parent,
            ref_count: self.ref_count.load(Ordering::Acquire),
            deleted: self.deleted,
            no_delay_close: self.no_delay_close,
            delayed: self.delayed,
            hive_root: self.hive_root,
            key_bodies: self.key_bodies.len(),
        }
    }
}

impl fmt::Debug for KeyControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyControlBlock")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// Snapshot of a node taken under its bucket lock
#[derive(Debug, Clone)]
pub struct KcbInfo {
    pub kcb: KcbRef,
    pub hive_id: HiveId,
    pub hive: Weak<Hive>,
    pub cell: CellIndex,
    pub path: String,
    pub rel_path: String,
    pub name: String,
    pub parent: Option<KcbRef>,
    pub ref_count: u32,
    pub deleted: bool,
    pub no_delay_close: bool,
    pub delayed: bool,
    pub hive_root: bool,
    pub key_bodies: usize,
}

/// One hash bucket: its chain of nodes
#[derive(Debug, Default)]
pub struct Bucket {
    nodes: AHashMap<KcbId, KeyControlBlock>,
}

impl Bucket {
    fn find_mut(&mut self, hive: HiveId, path: &str) -> Option<&mut KeyControlBlock> {
        self.nodes
            .values_mut()
            .find(|node| !node.deleted && node.hive_id == hive && node.path == path)
    }

    fn find(&self, hive: HiveId, path: &str) -> Option<&KeyControlBlock> {
        self.nodes
            .values()
            .find(|node| !node.deleted && node.hive_id == hive && node.path == path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What to find or create
#[derive(Debug)]
pub struct NodeSpec<'a> {
    pub hive: &'a Arc<Hive>,
    pub parent: Option<KcbRef>,
    pub conv_key: ConvKey,
    pub path: String,
    pub rel_path: String,
    pub name: &'a str,
    pub cell: CellIndex,
    pub hive_root: bool,
}

/// State observed while dropping a handle's hold
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub deleted: bool,
    pub hive: Weak<Hive>,
}

/// Work produced by node teardown, finished with no bucket lock held
#[derive(Default)]
struct Teardown {
    /// Holds to drop (parents of freed nodes)
    holds: Vec<KcbRef>,
    /// Evicted nodes whose bucket could not be taken in order
    evictions: Vec<KcbRef>,
    /// Unloaded hives whose root node was freed
    hives: Vec<Arc<Hive>>,
}

pub struct KcbCache {
    buckets: BucketLocks<Bucket>,
    delay_close: DelayCloseCache,
    next_id: AtomicU64,
    max_ref_count: u32,
    live: CachePadded<AtomicUsize>,
    freed: AtomicU64,
}

impl KcbCache {
    pub fn new(hash_table_size: usize, delay_close_size: usize, max_ref_count: u32) -> Self {
        KcbCache {
            buckets: BucketLocks::new(hash_table_size),
            delay_close: DelayCloseCache::new(delay_close_size),
            next_id: AtomicU64::new(1),
            max_ref_count,
            live: CachePadded::new(AtomicUsize::new(0)),
            freed: AtomicU64::new(0),
        }
    }

    pub fn buckets(&self) -> &BucketLocks<Bucket> {
        &self.buckets
    }

    pub fn bucket_index(&self, kcb: KcbRef) -> usize {
        self.buckets.index_of(kcb.conv_key)
    }

    /// Reference the node for `spec.path`, creating it if it is not cached.
    ///
    /// Locks the parent's and the child's buckets together. A new node takes
    /// a reference on its parent, which the caller must already hold.
    pub fn find_or_create(&self, spec: NodeSpec<'_>) -> Result<KcbRef> {
        let hive_id = spec.hive.id();
        let child_index = self.buckets.index_of(spec.conv_key);
        let parent_key = spec.parent.map_or(spec.conv_key, |p| p.conv_key);
        let mut held = self.buckets.lock_two_exclusive(parent_key, spec.conv_key);

        if let Some(node) = held.bucket_mut(child_index).find_mut(hive_id, &spec.path) {
            let previous = node
                .try_increment(self.max_ref_count)
                .map_err(|_| HiveError::RefCountOverflow(spec.path.clone()))?;
            if previous == 0 && node.delayed {
                node.delayed = false;
                self.delay_close.remove(node.id);
                trace!(path = %node.path, "node revived from delayed close");
            }
            return Ok(node.kcb_ref());
        }

        if let Some(parent) = spec.parent {
            let parent_index = self.buckets.index_of(parent.conv_key);
            let Some(parent_node) = held.bucket_mut(parent_index).nodes.get(&parent.id) else {
                panic!("parent {:?} of {} is not cached", parent.id, spec.path);
            };
            assert!(
                parent_node.ref_count.load(Ordering::Acquire) > 0,
                "creating {} under an unreferenced parent",
                spec.path
            );
            parent_node
                .try_increment(self.max_ref_count)
                .map_err(|_| HiveError::RefCountOverflow(parent_node.path.clone()))?;
        }

        let id = KcbId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let node = KeyControlBlock {
            id,
            conv_key: spec.conv_key,
            hive: Arc::downgrade(spec.hive),
            hive_id,
            cell: spec.cell,
            path: spec.path,
            rel_path: spec.rel_path,
            name: spec.name.to_string(),
            parent: spec.parent,
            ref_count: AtomicU32::new(1),
            deleted: false,
            no_delay_close: spec.hive.is_frozen(),
            delayed: false,
            hive_root: spec.hive_root,
            key_bodies: Vec::new(),
        };
        debug!(
            hive = %hive_id,
            path = %node.path,
            bucket = child_index,
            conv_key = spec.conv_key.0,
            "node created"
        );
        held.bucket_mut(child_index).nodes.insert(id, node);
        self.live.fetch_add(1, Ordering::AcqRel);

        Ok(KcbRef {
            id,
            conv_key: spec.conv_key,
        })
    }

    /// Add a reference to a cached node
    pub fn reference(&self, kcb: KcbRef) -> Result<()> {
        {
            let bucket = self.buckets.lock_shared(kcb.conv_key);
            let node = Self::node(&bucket, kcb);
            let mut current = node.ref_count.load(Ordering::Acquire);
            // reviving a zero-count node needs the exclusive lock
            while current > 0 {
                if current >= self.max_ref_count {
                    return Err(HiveError::RefCountOverflow(node.path.clone()));
                }
                match node.ref_count.compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(()),
                    Err(observed) => current = observed,
                }
            }
        }

        let mut bucket = self.buckets.lock_exclusive(kcb.conv_key);
        let node = Self::node_mut(&mut bucket, kcb);
        let previous = node
            .try_increment(self.max_ref_count)
            .map_err(|_| HiveError::RefCountOverflow(node.path.clone()))?;
        if previous == 0 && node.delayed {
            node.delayed = false;
            self.delay_close.remove(node.id);
        }
        Ok(())
    }

    /// Drop one reference; at zero the node is cached for reuse or freed
    pub fn dereference(&self, kcb: KcbRef) {
        let mut teardown = Teardown::default();
        teardown.holds.push(kcb);
        self.finish(teardown);
    }

    /// Take a closing handle's body off its node and drop the handle's
    /// reference, under one exclusive bucket hold
    pub fn delist_and_dereference(&self, kcb: KcbRef, body: BodyId) -> CloseOutcome {
        let index = self.buckets.index_of(kcb.conv_key);
        let mut teardown = Teardown::default();
        let outcome = {
            let mut bucket = self.buckets.lock_exclusive_by_index(index);
            let node = Self::node_mut(&mut bucket, kcb);
            let Some(position) = node.key_bodies.iter().position(|b| *b == body) else {
                panic!("{:?} is not on the body list of {}", body, node.path);
            };
            node.key_bodies.swap_remove(position);
            let outcome = CloseOutcome {
                deleted: node.deleted,
                hive: node.hive.clone(),
            };
            self.drop_hold_locked(&mut bucket, index, kcb, &mut teardown);
            outcome
        };
        self.finish(teardown);
        outcome
    }

    /// Record an ordinary handle's body on its node
    pub fn attach_body(&self, kcb: KcbRef, body: BodyId) {
        let mut bucket = self.buckets.lock_exclusive(kcb.conv_key);
        Self::node_mut(&mut bucket, kcb).key_bodies.push(body);
    }

    /// Tombstone a node; lookups stop finding it and its last close frees it
    pub fn mark_deleted(&self, kcb: KcbRef) {
        let mut bucket = self.buckets.lock_exclusive(kcb.conv_key);
        let node = Self::node_mut(&mut bucket, kcb);
        node.deleted = true;
        debug!(hive = %node.hive_id, path = %node.path, "node tombstoned");
    }

    /// Free every reuse-cache entry of `hive`, including parents that drop
    /// into the cache as a consequence
    pub fn flush_delayed_close(&self, hive: HiveId) -> usize {
        let mut flushed = 0;
        loop {
            let victims = self.delay_close.drain_hive(hive);
            if victims.is_empty() {
                break;
            }
            flushed += victims.len();
            let mut teardown = Teardown::default();
            teardown.evictions = victims;
            self.finish(teardown);
        }
        if flushed > 0 {
            debug!(hive = %hive, flushed, "delayed close entries flushed");
        }
        flushed
    }

    /// Stop caching closed nodes of `hive`. Returns the number of nodes tagged.
    pub fn tag_hive_no_delay_close(&self, hive: HiveId) -> usize {
        let mut tagged = 0;
        self.buckets.for_each_exclusive(|_, bucket| {
            for node in bucket.nodes.values_mut().filter(|n| n.hive_id == hive) {
                node.no_delay_close = true;
                tagged += 1;
            }
        });
        tagged
    }

    pub fn ref_count(&self, kcb: KcbRef) -> Option<u32> {
        let bucket = self.buckets.lock_shared(kcb.conv_key);
        bucket
            .nodes
            .get(&kcb.id)
            .map(|node| node.ref_count.load(Ordering::Acquire))
    }

    pub fn info(&self, kcb: KcbRef) -> Option<KcbInfo> {
        let bucket = self.buckets.lock_shared(kcb.conv_key);
        bucket.nodes.get(&kcb.id).map(KeyControlBlock::info)
    }

    pub fn contains(&self, kcb: KcbRef) -> bool {
        self.buckets.lock_shared(kcb.conv_key).nodes.contains_key(&kcb.id)
    }

    /// Look up the live node for a canonical path
    pub fn find(&self, hive: HiveId, path: &str) -> Option<KcbRef> {
        let key = ConvKey::of_path(path);
        let bucket = self.buckets.lock_shared(key);
        bucket.find(hive, path).map(KeyControlBlock::kcb_ref)
    }

    /// Nodes currently cached for `hive`
    pub fn hive_node_count(&self, hive: HiveId) -> usize {
        let mut count = 0;
        self.buckets.for_each_shared(|_, bucket| {
            count += bucket.nodes.values().filter(|n| n.hive_id == hive).count();
        });
        count
    }

    /// Nodes currently cached
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes sitting in the reuse cache
    pub fn delayed_len(&self) -> usize {
        self.delay_close.len()
    }

    /// Nodes physically freed so far
    pub fn freed_count(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    fn node(bucket: &Bucket, kcb: KcbRef) -> &KeyControlBlock {
        match bucket.nodes.get(&kcb.id) {
            Some(node) => node,
            None => panic!("{:?} is not cached", kcb.id),
        }
    }

    fn node_mut(bucket: &mut Bucket, kcb: KcbRef) -> &mut KeyControlBlock {
        match bucket.nodes.get_mut(&kcb.id) {
            Some(node) => node,
            None => panic!("{:?} is not cached", kcb.id),
        }
    }

    /// Drop one hold with `bucket` (index `index`) held exclusively
    fn drop_hold_locked(
        &self,
        bucket: &mut Bucket,
        index: usize,
        kcb: KcbRef,
        teardown: &mut Teardown,
    ) {
        let node = Self::node_mut(bucket, kcb);
        let previous = node.ref_count.load(Ordering::Acquire);
        assert!(previous > 0, "reference count underflow on {}", node.path);
        node.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return;
        }

        if !node.deleted && !node.no_delay_close && self.delay_close.enabled() {
            node.delayed = true;
            let hive = node.hive_id;
            trace!(path = %node.path, bucket = index, "node entered delayed close");

            if let Some(evicted) = self.delay_close.insert(kcb, hive) {
                let evicted_index = self.buckets.index_of(evicted.conv_key);
                if evicted_index == index {
                    self.evict_in(bucket, evicted, teardown);
                } else if force_acquire_allowed(&[index], evicted_index) {
                    let mut other = self.buckets.lock_exclusive_by_index(evicted_index);
                    self.evict_in(&mut other, evicted, teardown);
                } else {
                    teardown.evictions.push(evicted);
                }
            }
            return;
        }

        if let Some(node) = bucket.nodes.remove(&kcb.id) {
            self.free_node(node, teardown);
        }
    }

    /// Free an evicted node unless it was revived meanwhile
    fn evict_in(&self, bucket: &mut Bucket, kcb: KcbRef, teardown: &mut Teardown) {
        let still_closed = bucket
            .nodes
            .get(&kcb.id)
            .is_some_and(|n| n.delayed && n.ref_count.load(Ordering::Acquire) == 0);
        if !still_closed {
            return;
        }
        if let Some(node) = bucket.nodes.remove(&kcb.id) {
            trace!(path = %node.path, "delayed close entry evicted");
            self.free_node(node, teardown);
        }
    }

    fn free_node(&self, node: KeyControlBlock, teardown: &mut Teardown) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.freed.fetch_add(1, Ordering::Relaxed);
        debug!(
            hive = %node.hive_id,
            path = %node.path,
            deleted = node.deleted,
            "node freed"
        );

        if let Some(parent) = node.parent {
            teardown.holds.push(parent);
        }
        if node.hive_root {
            if let Some(hive) = node.hive.upgrade() {
                if hive.state() == HiveState::Unloaded {
                    teardown.hives.push(hive);
                }
            }
        }
    }

    /// Run teardown work until none is left. No bucket lock may be held.
    fn finish(&self, mut teardown: Teardown) {
        loop {
            if let Some(kcb) = teardown.holds.pop() {
                self.release_hold(kcb, &mut teardown);
            } else if let Some(kcb) = teardown.evictions.pop() {
                let index = self.buckets.index_of(kcb.conv_key);
                let mut bucket = self.buckets.lock_exclusive_by_index(index);
                self.evict_in(&mut bucket, kcb, &mut teardown);
            } else if let Some(hive) = teardown.hives.pop() {
                hive.release_storage();
            } else {
                break;
            }
        }
    }

    fn release_hold(&self, kcb: KcbRef, teardown: &mut Teardown) {
        let index = self.buckets.index_of(kcb.conv_key);
        {
            let bucket = self.buckets.lock_shared_by_index(index);
            if Self::node(&bucket, kcb).try_decrement_above_one() {
                return;
            }
        }
        let mut bucket = self.buckets.lock_exclusive_by_index(index);
        self.drop_hold_locked(&mut bucket, index, kcb, teardown);
    }
}

impl fmt::Debug for KcbCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KcbCache")
            .field("buckets", &self.buckets.len())
            .field("live", &self.len())
            .field("delayed", &self.delayed_len())
            .finish()
    }
}
