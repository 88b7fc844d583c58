//! Hive (store) objects
//!
//! A hive owns two storage spaces (stable and volatile), each an ordered run
//! of bins described by an extent map, plus a dirty-sector vector for the
//! stable space and an index of the keys it contains. All of that sits
//! behind the hive's mutation lock; the unload bookkeeping (frozen flag,
//! root node hold, unload task slot) lives outside it and is driven by the
//! registry.

pub mod cell;
pub mod dirty;
pub mod map;

pub use cell::{CellIndex, StorageKind, HBLOCK_SIZE, HCELL_TYPE_MASK, HSECTOR_SIZE};
pub use dirty::DirtyVector;
pub use map::{CellMap, MapEntry};

use crate::core::allocator::quota::{BinMemory, QuotaPool};
use crate::core::allocator::{self, SizeTracker};
use crate::core::error::{HiveError, Result};
use crate::core::kcb::KcbRef;
use crate::core::unload::UnloadSlot;
use cell::{round_to_blocks, HSPACE_LIMIT};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier of a loaded hive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HiveId(pub u32);

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hive#{}", self.0)
    }
}

/// Base descriptor written at the head of a hive file
#[derive(Debug, Clone)]
pub struct BaseBlock {
    pub signature: [u8; 4],
    pub sequence: u64,
    pub root_cell: CellIndex,
    pub name: String,
}

impl BaseBlock {
    pub const SIGNATURE: [u8; 4] = *b"regf";

    fn new(name: &str, root_cell: CellIndex) -> Self {
        BaseBlock {
            signature: Self::SIGNATURE,
            sequence: 1,
            root_cell,
            name: name.to_string(),
        }
    }
}

/// Free-extent tombstone
#[derive(Debug)]
pub struct FreeBin {
    /// Offset of the bin within its space
    pub offset: u32,
    /// Size in bytes (whole blocks)
    pub size: u32,
    /// Memory already released while the quota stays charged
    pub discarded: bool,
    /// Backing memory while the bin is still resident
    pub memory: Option<BinMemory>,
}

/// One storage space of a hive
#[derive(Debug)]
pub struct Storage {
    kind: StorageKind,
    /// Recorded length, tagged with the space's type bit
    length: u32,
    pub(crate) map: CellMap,
    pub(crate) free_bins: BTreeMap<u32, FreeBin>,
}

impl Storage {
    fn new(kind: StorageKind) -> Self {
        Storage {
            kind,
            length: kind.base(),
            map: CellMap::new(),
            free_bins: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Recorded length including the type bit; equals the space base when empty
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Length in bytes, without the type bit
    pub fn length_bytes(&self) -> u32 {
        self.length - self.kind.base()
    }

    pub fn is_empty(&self) -> bool {
        self.length == self.kind.base()
    }

    pub(crate) fn set_length_bytes(&mut self, bytes: u32) {
        self.length = self.kind.base() | bytes;
    }

    pub fn map(&self) -> &CellMap {
        &self.map
    }

    pub fn free_bins(&self) -> impl Iterator<Item = &FreeBin> {
        self.free_bins.values()
    }

    pub fn free_bin_count(&self) -> usize {
        self.free_bins.len()
    }

    fn install_allocated(&mut self, offset: u32, size: u32, memory: BinMemory) {
        let first = offset / HBLOCK_SIZE;
        let blocks = size / HBLOCK_SIZE;
        self.map.set(
            first,
            MapEntry::Allocated {
                bin_start: offset,
                memory: Some(memory),
            },
        );
        for block in first + 1..first + blocks {
            self.map.set(
                block,
                MapEntry::Allocated {
                    bin_start: offset,
                    memory: None,
                },
            );
        }
    }

    fn ensure_room(&self, size: u32) -> Result<()> {
        let bytes = self.length_bytes();
        if bytes.checked_add(size).map_or(true, |end| end > HSPACE_LIMIT) {
            return Err(HiveError::QuotaExceeded {
                requested: size as u64,
                available: (HSPACE_LIMIT - bytes) as u64,
            });
        }
        Ok(())
    }

    /// Allocate a bin of at least `size` bytes.
    ///
    /// A free bin of exactly the rounded size is reused first; it is still
    /// charged, so reuse never touches the quota.
    fn allocate(&mut self, size: u32, quota: &QuotaPool) -> Result<CellIndex> {
        let size = round_to_blocks(size.max(1));

        let reusable = self
            .free_bins
            .iter()
            .find(|(_, bin)| bin.size == size)
            .map(|(offset, _)| *offset);
        if let Some(offset) = reusable {
            if let Some(bin) = self.free_bins.remove(&offset) {
                let memory = match bin.memory {
                    Some(memory) => memory,
                    None => quota.allocate_memory(size),
                };
                self.install_allocated(offset, size, memory);
                return Ok(CellIndex::new(self.kind, offset));
            }
        }

        self.ensure_room(size)?;
        quota.charge(size as u64)?;
        let offset = self.length_bytes();
        let memory = quota.allocate_memory(size);
        self.install_allocated(offset, size, memory);
        self.set_length_bytes(offset + size);
        Ok(CellIndex::new(self.kind, offset))
    }

    /// Append a bin backed by a mapped view (no memory of our own, no quota)
    fn map_view(&mut self, size: u32) -> Result<CellIndex> {
        let size = round_to_blocks(size.max(1));
        self.ensure_room(size)?;
        let offset = self.length_bytes();
        let first = offset / HBLOCK_SIZE;
        for block in first..first + size / HBLOCK_SIZE {
            self.map.set(block, MapEntry::Mapped { bin_start: offset });
        }
        self.set_length_bytes(offset + size);
        Ok(CellIndex::new(self.kind, offset))
    }

    /// Turn the allocated bin starting at `cell` into a tombstone.
    /// Memory stays resident and quota stays charged.
    fn free(&mut self, cell: CellIndex) -> Result<u32> {
        let offset = cell.offset();
        if !cell.is_block_aligned() || offset >= self.length_bytes() {
            return Err(HiveError::InvalidCell(cell));
        }
        let memory = match self.map.get_mut(cell.block()) {
            Some(MapEntry::Allocated { bin_start, memory }) if *bin_start == offset => {
                memory.take()
            }
            _ => None,
        };
        let Some(memory) = memory else {
            return Err(HiveError::InvalidCell(cell));
        };

        let size = memory.size();
        let first = cell.block();
        for block in first..first + size / HBLOCK_SIZE {
            self.map
                .set(block, MapEntry::Discardable { bin_start: offset });
        }
        self.free_bins.insert(
            offset,
            FreeBin {
                offset,
                size,
                discarded: false,
                memory: Some(memory),
            },
        );
        Ok(size)
    }
}

/// Key recorded in a hive's index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub cell: CellIndex,
    /// Name with its original casing
    pub name: String,
}

/// Everything guarded by the hive mutation lock
#[derive(Debug)]
pub struct HiveStorage {
    pub(crate) base: Option<Box<BaseBlock>>,
    pub(crate) stable: Storage,
    pub(crate) volatile: Storage,
    pub(crate) dirty: DirtyVector,
    /// Lower-cased path relative to the hive root -> key record
    keys: BTreeMap<String, KeyRecord>,
}

impl HiveStorage {
    fn new() -> Self {
        HiveStorage {
            base: None,
            stable: Storage::new(StorageKind::Stable),
            volatile: Storage::new(StorageKind::Volatile),
            dirty: DirtyVector::new(),
            keys: BTreeMap::new(),
        }
    }

    pub fn space(&self, kind: StorageKind) -> &Storage {
        match kind {
            StorageKind::Stable => &self.stable,
            StorageKind::Volatile => &self.volatile,
        }
    }

    pub(crate) fn space_mut(&mut self, kind: StorageKind) -> &mut Storage {
        match kind {
            StorageKind::Stable => &mut self.stable,
            StorageKind::Volatile => &mut self.volatile,
        }
    }

    pub fn base(&self) -> Option<&BaseBlock> {
        self.base.as_deref()
    }

    pub fn dirty(&self) -> &DirtyVector {
        &self.dirty
    }

    pub fn key(&self, path: &str) -> Option<&KeyRecord> {
        self.keys.get(path)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Whether any key lives below `path`
    pub fn has_subkeys(&self, path: &str) -> bool {
        if path.is_empty() {
            return self.keys.len() > 1;
        }
        let prefix = format!("{}\\", path);
        self.keys
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn allocate(&mut self, kind: StorageKind, size: u32, quota: &QuotaPool) -> Result<CellIndex> {
        let cell = self.space_mut(kind).allocate(size, quota)?;
        if kind == StorageKind::Stable {
            self.dirty.grow_to_cover(self.stable.length_bytes());
            self.dirty.mark_range(cell.offset(), round_to_blocks(size.max(1)));
        }
        Ok(cell)
    }

    fn free(&mut self, cell: CellIndex) -> Result<()> {
        let size = self.space_mut(cell.kind()).free(cell)?;
        if cell.kind() == StorageKind::Stable {
            self.dirty.mark_range(cell.offset(), size);
        }
        Ok(())
    }

    fn check_shrink_boundary(&self, kind: StorageKind, start: CellIndex) -> Result<()> {
        let space = self.space(kind);
        let offset = start.offset();
        if start.kind() != kind || offset > space.length_bytes() {
            return Err(HiveError::InvalidCell(start));
        }
        if offset < space.length_bytes() {
            if !start.is_block_aligned() {
                return Err(HiveError::InvalidCell(start));
            }
            let on_boundary = match space.map.get(start.block()) {
                Some(MapEntry::Mapped { .. }) => true,
                Some(entry) => entry.bin_start() == Some(offset),
                None => false,
            };
            if !on_boundary {
                return Err(HiveError::InvalidCell(start));
            }
        }
        let live_key = self
            .keys
            .values()
            .any(|record| record.cell.kind() == kind && record.cell.offset() >= offset);
        if live_key {
            return Err(HiveError::InvalidCell(start));
        }
        Ok(())
    }

    fn insert_key(
        &mut self,
        path: String,
        name: &str,
        kind: StorageKind,
        quota: &QuotaPool,
    ) -> Result<CellIndex> {
        if self.keys.contains_key(&path) {
            return Err(HiveError::KeyExists(path));
        }
        let cell = self.allocate(kind, HBLOCK_SIZE, quota)?;
        self.keys.insert(
            path,
            KeyRecord {
                cell,
                name: name.to_string(),
            },
        );
        Ok(cell)
    }
}

/// Blueprint for a hive to be loaded
#[derive(Debug, Clone, Default)]
pub struct HiveSpec {
    pub name: String,
    /// Stable keys present at load time, as relative paths
    pub keys: Vec<String>,
    /// Volatile keys present at load time
    pub volatile_keys: Vec<String>,
    /// Blocks of stable storage backed by a mapped view
    pub mapped_blocks: u32,
}

impl HiveSpec {
    pub fn new(name: impl Into<String>) -> Self {
        HiveSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_volatile_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.volatile_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_mapped_blocks(mut self, blocks: u32) -> Self {
        self.mapped_blocks = blocks;
        self
    }
}

/// Normalize a relative key path: trim separators, lower-case, reject empty components
pub(crate) fn normalize_relative(path: &str) -> Result<(String, Vec<String>)> {
    let trimmed = path.trim_matches('\\');
    if trimmed.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut names = Vec::new();
    for component in trimmed.split('\\') {
        if component.is_empty() {
            return Err(HiveError::InvalidKeyName(path.to_string()));
        }
        names.push(component.to_string());
    }
    Ok((trimmed.to_lowercase(), names))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HiveState {
    Active = 0,
    /// Unmounted; storage is released when the root node's last hold goes away
    Unloaded = 1,
    Released = 2,
}

impl HiveState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HiveState::Active,
            1 => HiveState::Unloaded,
            _ => HiveState::Released,
        }
    }
}

pub struct Hive {
    id: HiveId,
    mount_path: String,
    storage: RwLock<HiveStorage>,
    quota: Arc<QuotaPool>,
    state: AtomicU8,
    frozen: AtomicBool,
    /// Root node held artificially while frozen
    root_kcb: Mutex<Option<KcbRef>>,
    pub(crate) unload_slot: UnloadSlot,
}

impl Hive {
    /// Build a hive from its blueprint, allocating the root and every listed key
    pub fn create(
        id: HiveId,
        mount_path: &str,
        spec: &HiveSpec,
        quota: Arc<QuotaPool>,
    ) -> Result<Hive> {
        let mut storage = HiveStorage::new();

        let populated = Self::populate(&mut storage, spec, &quota);
        if let Err(e) = populated {
            allocator::release_all(id, &mut storage, &quota);
            return Err(e);
        }

        info!(
            hive = %id,
            mount = mount_path,
            keys = storage.key_count(),
            stable_bytes = storage.stable.length_bytes(),
            "hive created"
        );

        Ok(Hive {
            id,
            mount_path: mount_path.to_string(),
            storage: RwLock::new(storage),
            quota,
            state: AtomicU8::new(HiveState::Active as u8),
            frozen: AtomicBool::new(false),
            root_kcb: Mutex::new(None),
            unload_slot: UnloadSlot::new(),
        })
    }

    fn populate(storage: &mut HiveStorage, spec: &HiveSpec, quota: &QuotaPool) -> Result<()> {
        let root = storage.insert_key(String::new(), &spec.name, StorageKind::Stable, quota)?;
        storage.base = Some(Box::new(BaseBlock::new(&spec.name, root)));

        let listed = spec
            .keys
            .iter()
            .map(|k| (k, StorageKind::Stable))
            .chain(spec.volatile_keys.iter().map(|k| (k, StorageKind::Volatile)));
        for (key, kind) in listed {
            let (_, names) = normalize_relative(key)?;
            let mut path = String::new();
            for name in &names {
                if !path.is_empty() {
                    path.push('\\');
                }
                path.push_str(&name.to_lowercase());
                if storage.key(&path).is_none() {
                    storage.insert_key(path.clone(), name, kind, quota)?;
                }
            }
        }

        if spec.mapped_blocks > 0 {
            storage
                .stable
                .map_view(spec.mapped_blocks * HBLOCK_SIZE)?;
            storage.dirty.grow_to_cover(storage.stable.length_bytes());
        }
        Ok(())
    }

    pub fn id(&self) -> HiveId {
        self.id
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Shared access under the mutation lock
    pub fn storage(&self) -> RwLockReadGuard<'_, HiveStorage> {
        self.storage.read()
    }

    /// Exclusive access under the mutation lock
    pub fn storage_mut(&self) -> RwLockWriteGuard<'_, HiveStorage> {
        self.storage.write()
    }

    pub fn root_cell(&self) -> Option<CellIndex> {
        self.storage().key("").map(|k| k.cell)
    }

    pub fn quota(&self) -> &Arc<QuotaPool> {
        &self.quota
    }

    pub fn allocate_bin(&self, kind: StorageKind, size: u32) -> Result<CellIndex> {
        self.storage_mut().allocate(kind, size, &self.quota)
    }

    pub fn map_bin(&self, kind: StorageKind, size: u32) -> Result<CellIndex> {
        let mut storage = self.storage_mut();
        let cell = storage.space_mut(kind).map_view(size)?;
        if kind == StorageKind::Stable {
            let length = storage.stable.length_bytes();
            storage.dirty.grow_to_cover(length);
        }
        Ok(cell)
    }

    pub fn free_bin(&self, cell: CellIndex) -> Result<()> {
        self.storage_mut().free(cell)
    }

    /// Release the memory of resident free bins, keeping their quota charged.
    /// Returns the number of bins discarded.
    pub fn discard_free_bins(&self) -> usize {
        let mut storage = self.storage_mut();
        let mut discarded = 0;
        for kind in StorageKind::ALL {
            for bin in storage.space_mut(kind).free_bins.values_mut() {
                if let Some(memory) = bin.memory.take() {
                    self.quota.release_memory(memory);
                    bin.discarded = true;
                    discarded += 1;
                }
            }
        }
        debug!(hive = %self.id, discarded, "free bins discarded");
        discarded
    }

    pub fn mark_dirty(&self, cell: CellIndex, len: u32) -> Result<()> {
        if cell.kind() != StorageKind::Stable {
            return Ok(());
        }
        let mut storage = self.storage_mut();
        if cell.offset().saturating_add(len) > storage.stable.length_bytes() {
            return Err(HiveError::InvalidCell(cell));
        }
        storage.dirty.mark_range(cell.offset(), len);
        Ok(())
    }

    pub fn lookup_key(&self, path: &str) -> Option<KeyRecord> {
        self.storage().key(path).cloned()
    }

    /// Allocate and index a new key at `path` (lower-cased relative path)
    pub fn add_key(&self, path: String, name: &str, kind: StorageKind) -> Result<CellIndex> {
        self.storage_mut().insert_key(path, name, kind, &self.quota)
    }

    /// Remove a leaf key from the index and free its bin
    pub fn remove_key(&self, path: &str) -> Result<()> {
        let mut storage = self.storage_mut();
        if storage.has_subkeys(path) {
            return Err(HiveError::HasSubkeys(path.to_string()));
        }
        let Some(cell) = storage.key(path).map(|record| record.cell) else {
            return Err(HiveError::KeyNotFound(path.to_string()));
        };
        // the record stays indexed unless its bin is really freed
        storage.free(cell)?;
        storage.keys.remove(path);
        Ok(())
    }

    pub fn has_subkeys(&self, path: &str) -> bool {
        self.storage().has_subkeys(path)
    }

    /// Write back dirty sectors. Returns the number of sectors flushed.
    pub fn flush(&self) -> usize {
        let mut storage = self.storage_mut();
        let flushed = storage.dirty.dirty_count();
        if flushed == 0 {
            return 0;
        }
        storage.dirty.clear_all();
        if let Some(base) = storage.base.as_mut() {
            base.sequence += 1;
        }
        debug!(hive = %self.id, sectors = flushed, "hive flushed");
        flushed
    }

    /// Shrink one storage space back to `start`.
    ///
    /// `start` must be a bin boundary in `kind` no further than the current
    /// length, with no key living at or past it.
    pub fn shrink(
        &self,
        kind: StorageKind,
        start: CellIndex,
        tracker: &dyn SizeTracker,
    ) -> Result<()> {
        let mut storage = self.storage_mut();
        storage.check_shrink_boundary(kind, start)?;
        allocator::release_suffix(self.id, &mut storage, start, kind, &self.quota, tracker);
        Ok(())
    }

    pub fn state(&self) -> HiveState {
        HiveState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == HiveState::Active
    }

    pub(crate) fn mark_unloaded(&self) {
        self.state
            .store(HiveState::Unloaded as u8, Ordering::Release);
    }

    /// Release every extent of an unloaded hive. Runs at most once.
    pub(crate) fn release_storage(&self) -> bool {
        if self
            .state
            .compare_exchange(
                HiveState::Unloaded as u8,
                HiveState::Released as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let mut storage = self.storage_mut();
        allocator::release_all(self.id, &mut storage, &self.quota);
        storage.keys.clear();
        info!(hive = %self.id, mount = %self.mount_path, "hive storage released");
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self, root: KcbRef) {
        *self.root_kcb.lock() = Some(root);
        self.frozen.store(true, Ordering::Release);
    }

    /// Clear the frozen state, handing back the artificially held root node
    pub(crate) fn unfreeze(&self) -> Option<KcbRef> {
        self.frozen.store(false, Ordering::Release);
        self.root_kcb.lock().take()
    }

    pub fn root_kcb(&self) -> Option<KcbRef> {
        *self.root_kcb.lock()
    }

    /// Whether a late unload task is installed for this hive
    pub fn unload_queued(&self) -> bool {
        self.unload_slot.is_installed()
    }
}

impl fmt::Debug for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hive")
            .field("id", &self.id)
            .field("mount_path", &self.mount_path)
            .field("state", &self.state())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
