//! Global registry lock
//!
//! A reader/writer lock with three acquire modes:
//! - shared
//! - shared, starving new writers (used by whole-namespace flushes)
//! - exclusive, recursive for the owning thread
//!
//! Releasing the outermost exclusive hold services a pending lazy-flush
//! request before the lock becomes available to the next waiter.

pub mod bucket;

pub use bucket::{force_acquire_allowed, BucketLocks, TwoBucketsExclusive, TwoBucketsShared};

use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Work run on the last exclusive release after a flush was requested
pub trait Flusher: Send + Sync {
    fn flush(&self);
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<ThreadId>,
    /// Exclusive hold depth of `writer`, nested shared acquires included
    recursion: u32,
    waiting_writers: usize,
    /// Shared holders that keep new writers out
    starve_writers: usize,
}

pub struct RegistryLock {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    flush_pending: AtomicBool,
    flusher: Mutex<Option<Arc<dyn Flusher>>>,
    flushes: AtomicU64,
}

impl RegistryLock {
    pub fn new() -> Self {
        RegistryLock {
            state: Mutex::new(LockState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            flush_pending: AtomicBool::new(false),
            flusher: Mutex::new(None),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn with_flusher(flusher: Arc<dyn Flusher>) -> Self {
        let lock = Self::new();
        lock.set_flusher(flusher);
        lock
    }

    pub fn set_flusher(&self, flusher: Arc<dyn Flusher>) {
        *self.flusher.lock() = Some(flusher);
    }

    /// Acquire in shared mode. Waits behind queued writers.
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.acquire_shared(false)
    }

    /// Acquire in shared mode, holding off writers until released.
    /// Does not wait behind queued writers.
    pub fn lock_shared_starve_writers(&self) -> SharedGuard<'_> {
        self.acquire_shared(true)
    }

    fn acquire_shared(&self, starve: bool) -> SharedGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.writer == Some(me) {
            state.recursion += 1;
            return SharedGuard::new(self, SharedMode::Nested);
        }

        if starve {
            while state.writer.is_some() {
                self.readers_cv.wait(&mut state);
            }
            state.starve_writers += 1;
        } else {
            while state.writer.is_some()
                || (state.waiting_writers > 0 && state.starve_writers == 0)
            {
                self.readers_cv.wait(&mut state);
            }
        }
        state.readers += 1;

        let mode = if starve {
            SharedMode::StarveWriters
        } else {
            SharedMode::Shared
        };
        SharedGuard::new(self, mode)
    }

    /// Acquire exclusively. Re-entrant for the thread that already owns it.
    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.writer == Some(me) {
            state.recursion += 1;
            return ExclusiveGuard::new(self);
        }

        state.waiting_writers += 1;
        while state.writer.is_some() || state.readers > 0 || state.starve_writers > 0 {
            self.writers_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        state.recursion = 1;
        ExclusiveGuard::new(self)
    }

    fn unlock_shared(&self, mode: SharedMode) {
        let mut state = self.state.lock();
        match mode {
            SharedMode::Nested => {
                assert!(state.recursion > 1, "nested shared release without exclusive hold");
                state.recursion -= 1;
                return;
            }
            SharedMode::StarveWriters => {
                state.starve_writers -= 1;
            }
            SharedMode::Shared => {}
        }
        assert!(state.readers > 0, "shared release without holders");
        state.readers -= 1;

        if state.readers == 0 {
            self.writers_cv.notify_one();
        }
        if state.starve_writers == 0 {
            self.readers_cv.notify_all();
        }
    }

    fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.writer,
            Some(thread::current().id()),
            "exclusive release by a thread that does not own the lock"
        );
        if state.recursion > 1 {
            state.recursion -= 1;
            return;
        }

        // Outermost release: run a requested flush while still the owner
        if self.flush_pending.swap(false, Ordering::AcqRel) {
            drop(state);
            self.run_flush();
            state = self.state.lock();
        }

        state.writer = None;
        state.recursion = 0;
        if state.waiting_writers > 0 {
            self.writers_cv.notify_one();
        }
        self.readers_cv.notify_all();
    }

    fn run_flush(&self) {
        let flusher = self.flusher.lock().clone();
        if let Some(flusher) = flusher {
            trace!("servicing lazy flush on exclusive release");
            flusher.flush();
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ask the last exclusive holder to flush on its way out
    pub fn request_flush(&self) {
        self.flush_pending.store(true, Ordering::Release);
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    /// Flushes performed on exclusive release so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn is_exclusive_owner(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Current exclusive hold depth (0 when not held exclusively)
    pub fn recursion(&self) -> u32 {
        self.state.lock().recursion
    }

    pub fn shared_holders(&self) -> usize {
        self.state.lock().readers
    }
}

impl Default for RegistryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SharedMode {
    Shared,
    StarveWriters,
    /// Shared acquire by the exclusive owner
    Nested,
}

/// Shared hold on the registry lock
#[must_use = "the lock is released when the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a RegistryLock,
    mode: SharedMode,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SharedGuard<'a> {
    fn new(lock: &'a RegistryLock, mode: SharedMode) -> Self {
        SharedGuard {
            lock,
            mode,
            _not_send: PhantomData,
        }
    }

    pub fn starves_writers(&self) -> bool {
        self.mode == SharedMode::StarveWriters
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared(self.mode);
    }
}

/// Exclusive hold on the registry lock
#[must_use = "the lock is released when the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a RegistryLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ExclusiveGuard<'a> {
    fn new(lock: &'a RegistryLock) -> Self {
        ExclusiveGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingFlusher {
        calls: AtomicUsize,
    }

    impl Flusher for CountingFlusher {
        fn flush(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_shared_holders_coexist() {
        let lock = RegistryLock::new();
        let a = lock.lock_shared();
        let b = lock.lock_shared();
        assert_eq!(lock.shared_holders(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.shared_holders(), 0);
    }

    #[test]
    fn test_exclusive_recursion() {
        let lock = RegistryLock::new();
        let outer = lock.lock_exclusive();
        let inner = lock.lock_exclusive();
        let nested_shared = lock.lock_shared();
        assert_eq!(lock.recursion(), 3);

        drop(nested_shared);
        drop(inner);
        assert!(lock.is_exclusive_owner());
        drop(outer);
        assert!(!lock.is_locked_exclusive());
    }

    #[test]
    fn test_flush_only_on_outermost_release() {
        let flusher = Arc::new(CountingFlusher {
            calls: AtomicUsize::new(0),
        });
        let lock = RegistryLock::with_flusher(flusher.clone());

        let outer = lock.lock_exclusive();
        let inner = lock.lock_exclusive();
        lock.request_flush();

        drop(inner);
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);
        assert!(lock.flush_pending());

        drop(outer);
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
        assert!(!lock.flush_pending());
        assert_eq!(lock.flush_count(), 1);
    }

    #[test]
    fn test_no_flush_without_request() {
        let flusher = Arc::new(CountingFlusher {
            calls: AtomicUsize::new(0),
        });
        let lock = RegistryLock::with_flusher(flusher.clone());
        drop(lock.lock_exclusive());
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = Arc::new(RegistryLock::new());
        let acquired = Arc::new(AtomicBool::new(false));

        let reader = lock.lock_shared();
        let handle = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _guard = lock.lock_exclusive();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(reader);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_starve_mode_admits_readers_past_waiting_writer() {
        let lock = Arc::new(RegistryLock::new());
        let flush_hold = lock.lock_shared_starve_writers();
        assert!(flush_hold.starves_writers());

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock_exclusive();
            })
        };
        // let the writer queue up
        while lock.state.lock().waiting_writers == 0 {
            thread::yield_now();
        }

        // a new reader still gets in
        let reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock_shared();
            })
        };
        reader.join().unwrap();

        drop(flush_hold);
        writer.join().unwrap();
        assert!(!lock.is_locked_exclusive());
    }
}
