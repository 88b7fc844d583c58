//! Late unload of frozen hives
//!
//! A hive frozen by `unload_hive_late` keeps an artificial hold on its root
//! node. When a close leaves that hold as the only reference, one unload
//! task is installed in the hive's slot and scheduled on the background
//! queue. The task re-validates everything under the exclusive registry
//! lock before unloading, and silently gives up if anything changed.

use crate::core::error::UnloadError;
use crate::core::hive::Hive;
use crate::core::registry::Registry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const EMPTY_SLOT: u64 = 0;

/// Per-hive slot holding the id of the one outstanding unload task
#[derive(Debug, Default)]
pub struct UnloadSlot {
    task: AtomicU64,
}

impl UnloadSlot {
    pub fn new() -> Self {
        UnloadSlot {
            task: AtomicU64::new(EMPTY_SLOT),
        }
    }

    /// Install `task` if the slot is empty. Exactly one racer wins.
    pub fn try_install(&self, task: u64) -> bool {
        debug_assert_ne!(task, EMPTY_SLOT);
        self.task
            .compare_exchange(EMPTY_SLOT, task, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Empty the slot if it still holds `task`
    pub fn clear_if(&self, task: u64) -> bool {
        self.task
            .compare_exchange(task, EMPTY_SLOT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn current(&self) -> Option<u64> {
        match self.task.load(Ordering::Acquire) {
            EMPTY_SLOT => None,
            task => Some(task),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.current().is_some()
    }
}

/// Task record; counted while alive so leaks are observable
pub(crate) struct UnloadTask {
    id: u64,
    hive: Arc<Hive>,
    live: Arc<AtomicUsize>,
}

impl UnloadTask {
    fn new(id: u64, hive: Arc<Hive>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        UnloadTask { id, hive, live }
    }
}

impl Drop for UnloadTask {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Schedule a late unload of `hive` if only the artificial root hold remains.
///
/// Losing the install race, or failing to schedule, leaves the hive frozen
/// for the next close to retry.
pub(crate) fn queue_late_unload(registry: &Registry, hive: &Arc<Hive>) {
    let Some(root) = hive.root_kcb() else {
        return;
    };
    if registry.cache().ref_count(root) != Some(1) {
        return;
    }

    let task = UnloadTask::new(
        registry.next_task_id(),
        Arc::clone(hive),
        registry.live_tasks_counter(),
    );
    let task_id = task.id;
    if !hive.unload_slot.try_install(task_id) {
        trace!(hive = %hive.id(), "late unload already installed");
        return;
    }

    let weak = registry.weak();
    let scheduled = registry.queue().schedule(Box::new(move || {
        if let Some(registry) = weak.upgrade() {
            run_late_unload(&registry, task);
        }
    }));
    match scheduled {
        Ok(()) => debug!(hive = %hive.id(), task = task_id, "late unload scheduled"),
        Err(e) => {
            hive.unload_slot.clear_if(task_id);
            warn!(hive = %hive.id(), error = %e, "late unload not scheduled");
        }
    }
}

fn run_late_unload(registry: &Registry, task: UnloadTask) {
    let guard = registry.lock().lock_exclusive();
    let hive = Arc::clone(&task.hive);
    hive.unload_slot.clear_if(task.id);
    drop(task);

    if !hive.is_frozen() {
        debug!(hive = %hive.id(), "late unload aborted: hive no longer frozen");
        return;
    }
    if registry.is_shutdown() {
        debug!(hive = %hive.id(), "late unload aborted: shutdown completed");
        return;
    }
    let Some(root) = hive.root_kcb() else {
        return;
    };
    let count = registry.cache().ref_count(root);
    if count != Some(1) {
        debug!(hive = %hive.id(), ?count, "late unload aborted: root reopened");
        return;
    }

    match registry.unload_locked(guard, &hive, root, true) {
        Ok(()) => {}
        Err(UnloadError::TooLate) => {
            debug!(hive = %hive.id(), "late unload aborted: too late");
            return;
        }
        Err(status) => panic!("{}: late unload refused with {:?}", hive.id(), status),
    }

    let _guard = registry.lock().lock_exclusive();
    registry.cache().dereference(root);
    registry.prune_released();
    info!(hive = %hive.id(), mount = hive.mount_path(), "hive unloaded on last close");
}
