//! Registry context
//!
//! Owns the global lock, the node cache, the mounted hives and the
//! collaborators (close notifier, task queue, size tracker). Created once
//! and passed around as `Arc<Registry>`; there is no global state.
//!
//! Lock order: registry lock, then bucket locks (in index order), then the
//! reuse-cache lock. A hive's mutation lock is only taken around extent
//! work and never while a bucket lock is held.

use crate::core::allocator::quota::QuotaPool;
use crate::core::allocator::{HiveHysteresis, SizeTracker};
use crate::core::config::RegistryConfig;
use crate::core::error::{HiveError, Result, UnloadError};
use crate::core::hive::{
    normalize_relative, CellIndex, Hive, HiveId, HiveSpec, HiveState, StorageKind,
};
use crate::core::kcb::name::{self, ConvKey};
use crate::core::kcb::{KcbCache, KcbRef, NodeSpec};
use crate::core::key_body::{BodyId, BodyKind, CloseNotifier, KeyBody, KeyHandle, NoopNotifier};
use crate::core::lock::{ExclusiveGuard, Flusher, RegistryLock};
use crate::core::unload;
use crate::core::workqueue::{TaskQueue, WorkQueue};
use ahash::AHashMap;
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Result of `unload_hive_late`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// Nothing else referenced the hive; it is unmounted now
    Unloaded,
    /// The hive is frozen and unloads when its last handle closes
    Pending,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub cached_nodes: usize,
    pub delayed_close_nodes: usize,
    pub mounted_hives: usize,
    pub loaded_hives: usize,
    pub open_handles: usize,
    pub live_unload_tasks: usize,
    pub quota_charged: u64,
    pub resident_bytes: u64,
    pub lazy_flushes: u64,
}

/// Flushes every hive when the last exclusive holder releases
struct LazyFlusher {
    registry: Weak<Registry>,
}

impl Flusher for LazyFlusher {
    fn flush(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.flush_hives();
        }
    }
}

/// Builder for [`Registry`]
pub struct RegistryBuilder {
    config: RegistryConfig,
    notifier: Option<Arc<dyn CloseNotifier>>,
    queue: Option<Arc<dyn TaskQueue>>,
    tracker: Option<Arc<dyn SizeTracker>>,
}

impl RegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        RegistryBuilder {
            config,
            notifier: None,
            queue: None,
            tracker: None,
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn CloseNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn SizeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<Arc<Registry>> {
        self.config.check()?;
        let config = self.config;

        let queue: Arc<dyn TaskQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(WorkQueue::new(config.worker_threads)?),
        };
        let notifier: Arc<dyn CloseNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(NoopNotifier),
        };
        let tracker: Arc<dyn SizeTracker> = match self.tracker {
            Some(tracker) => tracker,
            None => Arc::new(HiveHysteresis::default()),
        };

        info!(
            buckets = config.hash_table_size,
            delay_close = config.delay_close_size,
            quota = config.quota_limit_bytes,
            "registry initialized"
        );

        Ok(Arc::new_cyclic(|weak: &Weak<Registry>| Registry {
            lock: RegistryLock::with_flusher(Arc::new(LazyFlusher {
                registry: weak.clone(),
            })),
            cache: KcbCache::new(
                config.hash_table_size,
                config.delay_close_size,
                config.max_ref_count,
            ),
            mounts: RwLock::new(BTreeMap::new()),
            hives: RwLock::new(AHashMap::new()),
            quota: Arc::new(QuotaPool::new(config.quota_limit_bytes)),
            notifier,
            queue,
            tracker,
            shutdown: AtomicBool::new(false),
            next_hive: AtomicU32::new(1),
            next_body: AtomicU64::new(1),
            next_task: AtomicU64::new(1),
            live_tasks: Arc::new(AtomicUsize::new(0)),
            open_handles: CachePadded::new(AtomicUsize::new(0)),
            self_ref: weak.clone(),
            config,
        }))
    }
}

pub struct Registry {
    config: RegistryConfig,
    lock: RegistryLock,
    cache: KcbCache,
    /// Canonical mount path -> mounted hive
    mounts: RwLock<BTreeMap<String, Arc<Hive>>>,
    /// Every hive whose storage has not been released yet
    hives: RwLock<AHashMap<HiveId, Arc<Hive>>>,
    quota: Arc<QuotaPool>,
    notifier: Arc<dyn CloseNotifier>,
    queue: Arc<dyn TaskQueue>,
    tracker: Arc<dyn SizeTracker>,
    shutdown: AtomicBool,
    next_hive: AtomicU32,
    next_body: AtomicU64,
    next_task: AtomicU64,
    live_tasks: Arc<AtomicUsize>,
    open_handles: CachePadded<AtomicUsize>,
    self_ref: Weak<Registry>,
}

impl Registry {
    /// Registry with the default collaborators
    pub fn new(config: RegistryConfig) -> Result<Arc<Registry>> {
        RegistryBuilder::new(config).build()
    }

    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn lock(&self) -> &RegistryLock {
        &self.lock
    }

    pub fn cache(&self) -> &KcbCache {
        &self.cache
    }

    pub fn quota(&self) -> &Arc<QuotaPool> {
        &self.quota
    }

    pub(crate) fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub(crate) fn weak(&self) -> Weak<Registry> {
        self.self_ref.clone()
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn live_tasks_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live_tasks)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Loaded hive by id, including unmounted hives awaiting release
    pub fn hive(&self, id: HiveId) -> Option<Arc<Hive>> {
        self.hives.read().get(&id).cloned()
    }

    /// Hive mounted exactly at `mount_path`
    pub fn mounted(&self, mount_path: &str) -> Option<Arc<Hive>> {
        self.mounts.read().get(&name::canonical(mount_path)).cloned()
    }

    /// Mount a new hive at `mount_path`.
    ///
    /// Loading onto the mount point of a frozen hive thaws it instead and
    /// returns its id.
    pub fn load_hive(&self, mount_path: &str, spec: &HiveSpec) -> Result<HiveId> {
        let mount = name::canonical(mount_path);
        if mount.is_empty() {
            return Err(HiveError::InvalidKeyName(mount_path.to_string()));
        }
        let _guard = self.lock.lock_exclusive();

        let existing = self.mounts.read().get(&mount).cloned();
        if let Some(hive) = existing {
            if !hive.is_frozen() {
                return Err(HiveError::MountConflict(mount));
            }
            if let Some(root) = hive.unfreeze() {
                self.cache.dereference(root);
            }
            info!(hive = %hive.id(), mount = %mount, "frozen hive remounted");
            return Ok(hive.id());
        }

        let id = HiveId(self.next_hive.fetch_add(1, Ordering::Relaxed));
        let hive = Arc::new(Hive::create(id, &mount, spec, Arc::clone(&self.quota))?);
        self.mounts.write().insert(mount.clone(), Arc::clone(&hive));
        self.hives.write().insert(id, hive);
        info!(hive = %id, mount = %mount, "hive loaded");
        Ok(id)
    }

    /// Open an ordinary handle on `path`
    pub fn open_key(self: &Arc<Self>, path: &str) -> Result<KeyHandle> {
        self.open(path, BodyKind::Ordinary)
    }

    /// Open a predefined handle on `path`
    pub fn open_predefined(self: &Arc<Self>, path: &str) -> Result<KeyHandle> {
        self.open(path, BodyKind::Predefined)
    }

    fn open(self: &Arc<Self>, path: &str, kind: BodyKind) -> Result<KeyHandle> {
        let canonical = name::canonical(path);
        let _guard = self.lock.lock_shared();

        let (hive, mount, relative) = self.resolve(&canonical)?;
        if !hive.is_active() {
            return Err(HiveError::HiveUnloading(hive.id()));
        }
        let (rel_path, names) = normalize_relative(&relative)?;
        if hive.lookup_key(&rel_path).is_none() {
            return Err(HiveError::KeyNotFound(canonical));
        }

        let kcb = self.reference_path(&hive, &mount, &names)?;
        Ok(self.attach(kcb, kind, hive.id(), canonical))
    }

    /// Longest mounted prefix of a canonical path
    fn resolve(&self, canonical: &str) -> Result<(Arc<Hive>, String, String)> {
        let mounts = self.mounts.read();
        let mut best: Option<(&String, &Arc<Hive>)> = None;
        for (mount, hive) in mounts.iter() {
            let covers = canonical == mount.as_str()
                || (canonical.starts_with(mount.as_str())
                    && canonical[mount.len()..].starts_with(name::SEPARATOR));
            if covers && best.map_or(true, |(m, _)| mount.len() > m.len()) {
                best = Some((mount, hive));
            }
        }
        match best {
            Some((mount, hive)) => Ok((
                Arc::clone(hive),
                mount.clone(),
                canonical[mount.len()..].to_string(),
            )),
            None => Err(HiveError::NoHiveMounted(canonical.to_string())),
        }
    }

    /// Reference every node from the hive root down to `names`, keeping only
    /// the hold on the last one
    fn reference_path(&self, hive: &Arc<Hive>, mount: &str, names: &[String]) -> Result<KcbRef> {
        let root_cell = hive
            .root_cell()
            .ok_or_else(|| HiveError::KeyNotFound(mount.to_string()))?;
        let leaf = name::components(mount).last().unwrap_or_default();
        let mut current = self.cache.find_or_create(NodeSpec {
            hive,
            parent: None,
            conv_key: ConvKey::of_path(mount),
            path: mount.to_string(),
            rel_path: String::new(),
            name: leaf,
            cell: root_cell,
            hive_root: true,
        })?;

        let mut rel_path = String::new();
        for component in names {
            if !rel_path.is_empty() {
                rel_path.push(name::SEPARATOR);
            }
            rel_path.push_str(&component.to_lowercase());

            let step = match hive.lookup_key(&rel_path) {
                Some(record) => self.cache.find_or_create(NodeSpec {
                    hive,
                    parent: Some(current),
                    conv_key: current.conv_key.extend(component),
                    path: name::join(mount, &rel_path),
                    rel_path: rel_path.clone(),
                    name: &record.name,
                    cell: record.cell,
                    hive_root: false,
                }),
                None => Err(HiveError::KeyNotFound(name::join(mount, &rel_path))),
            };
            // the child holds its parent now; drop the walk's hold
            self.cache.dereference(current);
            current = step?;
        }
        Ok(current)
    }

    fn attach(self: &Arc<Self>, kcb: KcbRef, kind: BodyKind, hive: HiveId, path: String) -> KeyHandle {
        let id = BodyId(self.next_body.fetch_add(1, Ordering::Relaxed));
        if kind == BodyKind::Ordinary {
            self.cache.attach_body(kcb, id);
        }
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        KeyHandle::new(Arc::clone(self), KeyBody::new(id, kcb, kind, hive), path)
    }

    /// Close a handle's body. Called exactly once per body, by the handle.
    ///
    /// Cannot fail. If the close leaves a frozen hive's root with only its
    /// artificial hold, a late unload is queued.
    pub fn close(&self, body: KeyBody) {
        let Some(kcb) = body.kcb else {
            panic!("{:?} closed without a control block", body.id);
        };

        match body.kind {
            BodyKind::Predefined => {
                let released = {
                    let _guard = self.lock.lock_shared();
                    let hive = self.hive_of(kcb);
                    self.cache.dereference(kcb);
                    hive.is_some_and(|h| h.state() == HiveState::Released)
                };
                if released {
                    self.prune_released();
                }
            }
            BodyKind::Ordinary => {
                self.notifier.pre_close(&body);
                let released = {
                    let _guard = self.lock.lock_shared();
                    let outcome = self.cache.delist_and_dereference(kcb, body.id);
                    let hive = outcome.hive.upgrade();
                    if !outcome.deleted {
                        if let Some(hive) = hive.as_ref().filter(|h| h.is_frozen()) {
                            unload::queue_late_unload(self, hive);
                        }
                    }
                    hive.is_some_and(|h| h.state() == HiveState::Released)
                };
                if released {
                    self.prune_released();
                }
                self.notifier.post_close(&body);
            }
        }
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }

    /// Create a stable subkey under `parent` and open it
    pub fn create_key(self: &Arc<Self>, parent: &KeyHandle, key_name: &str) -> Result<KeyHandle> {
        self.create(parent, key_name, StorageKind::Stable)
    }

    /// Create a volatile subkey under `parent` and open it
    pub fn create_volatile_key(
        self: &Arc<Self>,
        parent: &KeyHandle,
        key_name: &str,
    ) -> Result<KeyHandle> {
        self.create(parent, key_name, StorageKind::Volatile)
    }

    fn create(self: &Arc<Self>, parent: &KeyHandle, key_name: &str, kind: StorageKind) -> Result<KeyHandle> {
        if !name::is_valid_name(key_name) {
            return Err(HiveError::InvalidKeyName(key_name.to_string()));
        }
        let _guard = self.lock.lock_exclusive();

        let parent_kcb = parent.kcb();
        let info = self.cache.info(parent_kcb).ok_or(HiveError::KeyDeleted)?;
        if info.deleted {
            return Err(HiveError::KeyDeleted);
        }
        let hive = info
            .hive
            .upgrade()
            .filter(|h| h.is_active())
            .ok_or(HiveError::HiveUnloading(info.hive_id))?;

        let lower = key_name.to_lowercase();
        let rel_path = if info.rel_path.is_empty() {
            lower.clone()
        } else {
            name::join(&info.rel_path, &lower)
        };
        let path = name::join(&info.path, &lower);
        if hive.lookup_key(&rel_path).is_some() {
            return Err(HiveError::KeyExists(path));
        }

        let cell = hive.add_key(rel_path.clone(), key_name, kind)?;
        let created = self.cache.find_or_create(NodeSpec {
            hive: &hive,
            parent: Some(parent_kcb),
            conv_key: parent_kcb.conv_key.extend(key_name),
            path: path.clone(),
            rel_path: rel_path.clone(),
            name: key_name,
            cell,
            hive_root: false,
        });
        let kcb = match created {
            Ok(kcb) => kcb,
            Err(e) => {
                if let Err(rollback) = hive.remove_key(&rel_path) {
                    warn!(path = %path, error = %rollback, "key creation rollback failed");
                }
                return Err(e);
            }
        };
        debug!(hive = %hive.id(), path = %path, ?cell, "key created");
        Ok(self.attach(kcb, BodyKind::Ordinary, hive.id(), path))
    }

    /// Delete the key `handle` is open on. Open handles keep the node until
    /// they close.
    pub fn delete_key(&self, handle: &KeyHandle) -> Result<()> {
        let _guard = self.lock.lock_exclusive();

        let kcb = handle.kcb();
        let info = self.cache.info(kcb).ok_or(HiveError::KeyDeleted)?;
        if info.deleted {
            return Err(HiveError::KeyDeleted);
        }
        if info.hive_root {
            return Err(UnloadError::CannotDelete.into());
        }
        let hive = info
            .hive
            .upgrade()
            .filter(|h| h.is_active())
            .ok_or(HiveError::HiveUnloading(info.hive_id))?;
        if hive.has_subkeys(&info.rel_path) {
            return Err(HiveError::HasSubkeys(info.path));
        }

        hive.remove_key(&info.rel_path)?;
        self.cache.mark_deleted(kcb);
        debug!(hive = %hive.id(), path = %info.path, "key deleted");
        Ok(())
    }

    fn hive_of(&self, kcb: KcbRef) -> Option<Arc<Hive>> {
        self.cache.info(kcb).and_then(|info| info.hive.upgrade())
    }

    /// Unload the hive whose root `handle` is open on.
    ///
    /// Fails `InvalidParameter` if the handle is not on a hive root,
    /// `TooLate` if the hive is already frozen or has an unload queued, and
    /// `CannotDelete` if anything besides this handle references the hive.
    /// Storage is released when the handle closes.
    pub fn unload_hive(&self, handle: &KeyHandle) -> Result<()> {
        let guard = self.lock.lock_exclusive();
        let root = handle.kcb();
        let hive = self.hive_of(root).ok_or(UnloadError::InvalidParameter)?;
        self.unload_locked(guard, &hive, root, false)?;
        Ok(())
    }

    /// Unload now if possible, otherwise freeze the hive so that it unloads
    /// once its last handle closes
    pub fn unload_hive_late(&self, handle: &KeyHandle) -> Result<UnloadOutcome> {
        let _guard = self.lock.lock_exclusive();
        let root = handle.kcb();
        let hive = self.hive_of(root).ok_or(UnloadError::InvalidParameter)?;

        match self.try_unload(&hive, root, false) {
            Ok(()) => Ok(UnloadOutcome::Unloaded),
            Err(UnloadError::CannotDelete) => {
                let tagged = self.cache.tag_hive_no_delay_close(hive.id());
                self.cache.reference(root)?;
                hive.freeze(root);
                info!(hive = %hive.id(), tagged, "hive frozen until last close");
                Ok(UnloadOutcome::Pending)
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Unload with the registry lock held exclusively; the lock is released
    /// before returning
    pub(crate) fn unload_locked(
        &self,
        guard: ExclusiveGuard<'_>,
        hive: &Arc<Hive>,
        root: KcbRef,
        late: bool,
    ) -> std::result::Result<(), UnloadError> {
        let result = self.try_unload(hive, root, late);
        drop(guard);
        result
    }

    fn try_unload(&self, hive: &Arc<Hive>, root: KcbRef, late: bool) -> std::result::Result<(), UnloadError> {
        debug_assert!(self.lock.is_exclusive_owner());

        let info = self.cache.info(root).ok_or(UnloadError::InvalidParameter)?;
        if !info.hive_root || info.deleted || info.hive_id != hive.id() {
            return Err(UnloadError::InvalidParameter);
        }
        if !hive.is_active() {
            return Err(UnloadError::TooLate);
        }
        if !late && (hive.is_frozen() || hive.unload_slot.is_installed()) {
            return Err(UnloadError::TooLate);
        }

        self.cache.flush_delayed_close(hive.id());
        if self.cache.ref_count(root) != Some(1) {
            return Err(UnloadError::CannotDelete);
        }

        self.mounts.write().remove(hive.mount_path());
        hive.mark_unloaded();
        self.cache.mark_deleted(root);
        if late {
            // the artificial hold now belongs to the caller's final dereference
            hive.unfreeze();
        }
        info!(hive = %hive.id(), mount = hive.mount_path(), late, "hive unmounted");
        Ok(())
    }

    /// Forget hives whose storage has been released
    pub(crate) fn prune_released(&self) {
        self.hives
            .write()
            .retain(|_, hive| hive.state() != HiveState::Released);
    }

    /// Shrink one storage space of a hive back to `start`
    pub fn shrink_hive(&self, id: HiveId, kind: StorageKind, start: CellIndex) -> Result<()> {
        let hive = self
            .hive(id)
            .filter(|h| h.is_active())
            .ok_or_else(|| HiveError::NoHiveMounted(id.to_string()))?;
        hive.shrink(kind, start, self.tracker.as_ref())
    }

    /// Flush every loaded hive, holding off new writers meanwhile.
    /// Returns the number of sectors written.
    pub fn flush_all(&self) -> usize {
        let _guard = self.lock.lock_shared_starve_writers();
        self.flush_hives()
    }

    fn flush_hives(&self) -> usize {
        let hives: Vec<Arc<Hive>> = self
            .hives
            .read()
            .values()
            .filter(|h| h.is_active())
            .cloned()
            .collect();
        let sectors: usize = hives.iter().map(|hive| hive.flush()).sum();
        debug!(hives = hives.len(), sectors, "hives flushed");
        sectors
    }

    /// Have the next outermost exclusive release flush every hive
    pub fn request_lazy_flush(&self) {
        self.lock.request_flush();
    }

    /// Wait for queued background work, late unloads included
    pub fn drain_queue(&self) {
        self.queue.drain();
    }

    /// Mark shutdown complete and wait for queued work; pending late
    /// unloads abort
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.drain();
        info!("registry shut down");
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            cached_nodes: self.cache.len(),
            delayed_close_nodes: self.cache.delayed_len(),
            mounted_hives: self.mounts.read().len(),
            loaded_hives: self.hives.read().len(),
            open_handles: self.open_handles.load(Ordering::Acquire),
            live_unload_tasks: self.live_tasks.load(Ordering::Acquire),
            quota_charged: self.quota.charged(),
            resident_bytes: self.quota.resident(),
            lazy_flushes: self.lock.flush_count(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
