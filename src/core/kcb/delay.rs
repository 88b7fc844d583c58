//! Delayed-close reuse cache
//!
//! Nodes whose count reaches zero stay indexed and are remembered here in
//! LRU order. Pushing past capacity evicts the least recently closed node,
//! which the caller must then free. This lock is a leaf: no bucket lock is
//! ever acquired while it is held.

use super::{KcbId, KcbRef};
use crate::core::hive::HiveId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub struct DelayCloseCache {
    /// `None` when delayed close is disabled
    entries: Option<Mutex<LruCache<KcbId, (KcbRef, HiveId)>>>,
}

impl DelayCloseCache {
    pub fn new(capacity: usize) -> Self {
        DelayCloseCache {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Remember a node that just reached zero; returns the node evicted to make room
    pub fn insert(&self, kcb: KcbRef, hive: HiveId) -> Option<KcbRef> {
        let entries = self.entries.as_ref()?;
        match entries.lock().push(kcb.id, (kcb, hive)) {
            Some((id, (evicted, _))) if id != kcb.id => Some(evicted),
            _ => None,
        }
    }

    /// Forget a node that was revived
    pub fn remove(&self, id: KcbId) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.lock().pop(&id).is_some())
    }

    /// Take every entry belonging to `hive`
    pub fn drain_hive(&self, hive: HiveId) -> Vec<KcbRef> {
        let Some(entries) = self.entries.as_ref() else {
            return Vec::new();
        };
        let mut entries = entries.lock();
        let ids: Vec<KcbId> = entries
            .iter()
            .filter(|(_, (_, owner))| *owner == hive)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.pop(&id).map(|(kcb, _)| kcb))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .as_ref()
            .map_or(0, |entries| entries.lock().cap().get())
    }
}
