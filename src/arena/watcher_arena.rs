// Watcher arena - storage for computation-node bookkeeping.
//
// WatcherMetadata carries everything the scheduler and the publishers need
// to drive a watcher without knowing its value type:
// - uid: monotonic creation id, the flush ordering key (slab indices are
//   reused and cannot order anything)
// - flags: the four policy booleans (deep/user/lazy/sync)
// - active/dirty bits
// - the double-buffered dependency sets (current + pending)
// - the type-erased run job and the optional before hook
//
// The typed half of a watcher (last value, evaluator, callback) lives in
// Watcher<T>'s Arc'd inner, outside the arena; the job closure captures that
// Arc and is the only bridge between the two.
//
// The evaluation-context stack lives here too: a thread-local Vec of
// Option<WatcherId> frames. A None frame is an untracked region. TargetGuard
// pushes on construction and pops on drop, so the pop survives early returns
// and unwinding - a stale frame would corrupt every subsequent dependency
// registration on the thread.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use slab::Slab;

use crate::error::WatchError;
use crate::hash::FastIndexSet;

use super::dep_arena::DepId;

/// Global watcher arena - stores all computation-node metadata.
static WATCHER_ARENA: RwLock<Slab<WatcherMetadata>> = RwLock::new(Slab::new());

/// Source of monotonic watcher uids, shared by every thread.
static NEXT_UID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The stack of watchers currently collecting dependencies on this
    /// thread. The innermost frame attributes tracked reads; `None` frames
    /// suppress tracking entirely.
    static TARGET_STACK: RefCell<Vec<Option<WatcherId>>> = const { RefCell::new(Vec::new()) };
}

/// The watcher currently collecting dependencies on this thread, if any.
pub fn current_target() -> Option<WatcherId> {
    TARGET_STACK.with(|stack| stack.borrow().last().copied().flatten())
}

/// RAII frame on the evaluation-context stack.
///
/// Pushes the given target on construction and pops it on drop, which keeps
/// push/pop pairs matched even when the evaluator errors or panics.
pub struct TargetGuard {
    _priv: (),
}

impl TargetGuard {
    /// Push `target` as the innermost evaluation context. `None` makes the
    /// region untracked.
    pub fn new(target: Option<WatcherId>) -> Self {
        TARGET_STACK.with(|stack| stack.borrow_mut().push(target));
        Self { _priv: () }
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        TARGET_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Policy flags of a watcher, fixed at construction.
#[derive(Copy, Clone, Debug, Default)]
pub struct WatchFlags {
    /// Force full-subtree dependency discovery after every evaluation.
    pub deep: bool,
    /// Report evaluator/callback errors instead of propagating them.
    pub user: bool,
    /// Never auto re-run; mark dirty and recompute on demand.
    pub lazy: bool,
    /// Re-run inline on notification instead of going through the scheduler.
    pub sync: bool,
}

/// Type-erased run cycle installed by `Watcher<T>`.
pub(crate) type Job = Box<dyn FnMut() -> Result<(), WatchError> + Send>;

/// Unique identifier for a watcher in the arena.
///
/// Zero-cost wrapper around a slab index; ordering semantics come from the
/// metadata's `uid`, not from the index. Stale access returns `None`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WatcherId(u32);

impl WatcherId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the watcher metadata with a closure. `None` if torn down.
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&WatcherMetadata) -> R,
    {
        let arena = WATCHER_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Monotonic creation id; the scheduler's ordering key.
    pub(crate) fn uid(self) -> Option<u64> {
        self.with(|meta| meta.uid)
    }

    pub(crate) fn flags(self) -> Option<WatchFlags> {
        self.with(|meta| meta.flags)
    }

    pub(crate) fn is_active(self) -> bool {
        self.with(|meta| meta.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Clear `active`; returns true if the watcher was active before.
    pub(crate) fn deactivate(self) -> bool {
        self.with(|meta| meta.active.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }

    pub(crate) fn is_dirty(self) -> bool {
        self.with(|meta| meta.dirty.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn set_dirty(self, dirty: bool) {
        self.with(|meta| meta.dirty.store(dirty, Ordering::Release));
    }

    /// Execute a closure with the current (post-reconciliation) dependency
    /// set.
    pub(crate) fn with_deps<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&FastIndexSet<DepId>) -> R,
    {
        self.with(|meta| {
            let sets = meta.deps.read();
            f(&sets.current)
        })
    }

    /// Drop a dep from both buffers. Called when the dep itself is dropped
    /// so the watcher is not left holding a dangling edge.
    pub(crate) fn forget_dep(self, dep: DepId) {
        self.with(|meta| {
            let mut sets = meta.deps.write();
            sets.current.swap_remove(&dep);
            sets.pending.swap_remove(&dep);
        });
    }

    /// Detach and return every currently-held dep, clearing both buffers.
    /// Teardown uses this; the caller unsubscribes from each returned dep.
    pub(crate) fn detach_all_deps(self) -> Vec<DepId> {
        self.with(|meta| {
            let mut sets = meta.deps.write();
            let detached: Vec<DepId> = sets.current.iter().copied().collect();
            sets.current.clear();
            sets.pending.clear();
            detached
        })
        .unwrap_or_default()
    }

    pub(crate) fn install_job(self, job: Job) {
        self.with(|meta| {
            *meta.job.lock() = Some(job);
        });
    }

    pub(crate) fn set_before(self, hook: Box<dyn FnMut() + Send>) {
        self.with(|meta| {
            *meta.before.lock() = Some(hook);
        });
    }

    /// Invoke the before hook, if one is installed. The scheduler calls this
    /// immediately prior to a queued run.
    pub(crate) fn call_before(self) {
        let hook = self.with(|meta| meta.before.lock().take()).flatten();
        if let Some(mut hook) = hook {
            hook();
            self.with(|meta| {
                let mut slot = meta.before.lock();
                if slot.is_none() {
                    *slot = Some(hook);
                }
            });
        }
    }

    /// Run this watcher's erased job.
    ///
    /// The job is taken out of the arena for the duration of the call so the
    /// arena lock is not held while user code executes; a drop guard puts it
    /// back even if the job panics. A missing job (torn down, or already
    /// running on this call stack) is a no-op.
    pub(crate) fn run_job(self) -> Result<(), WatchError> {
        struct JobGuard {
            watcher: WatcherId,
            job: Option<Job>,
        }

        impl Drop for JobGuard {
            fn drop(&mut self) {
                if let Some(job) = self.job.take() {
                    self.watcher.with(|meta| {
                        *meta.job.lock() = Some(job);
                    });
                }
            }
        }

        let job = self.with(|meta| meta.job.lock().take()).flatten();
        let Some(job) = job else {
            return Ok(());
        };

        let mut guard = JobGuard {
            watcher: self,
            job: Some(job),
        };
        let result = guard
            .job
            .as_mut()
            .map(|job| job())
            .unwrap_or(Ok(()));
        drop(guard);
        result
    }
}

/// Metadata for a computation node stored in the arena.
pub struct WatcherMetadata {
    /// Monotonic creation id. Earlier watchers run first within a flush.
    pub(crate) uid: u64,
    pub(crate) flags: WatchFlags,
    /// False forever after teardown.
    pub(crate) active: AtomicBool,
    /// Lazy-only staleness bit.
    pub(crate) dirty: AtomicBool,
    pub(crate) deps: RwLock<DepSets>,
    pub(crate) job: Mutex<Option<Job>>,
    pub(crate) before: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl WatcherMetadata {
    pub(crate) fn new(flags: WatchFlags) -> Self {
        Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            flags,
            active: AtomicBool::new(true),
            // Lazy watchers start stale: the first read must compute.
            dirty: AtomicBool::new(flags.lazy),
            deps: RwLock::new(DepSets::default()),
            job: Mutex::new(None),
            before: Mutex::new(None),
        }
    }
}

/// Double-buffered dependency sets.
///
/// `pending` is filled during an in-flight evaluation; reconciliation swaps
/// the buffers and clears the retired one, so the containers are reused on
/// every re-run instead of reallocated.
#[derive(Default)]
pub(crate) struct DepSets {
    pub(crate) current: FastIndexSet<DepId>,
    pub(crate) pending: FastIndexSet<DepId>,
}

/// Record a tracked read of `dep` by `watcher` (the dependency-registration
/// protocol).
///
/// Two-level check: insertion into `pending` deduplicates repeated reads
/// within one evaluation; the `current` lookup skips the subscribe call for
/// deps still held from the previous evaluation. Only a genuinely new dep
/// costs an `add_sub`.
pub fn add_dep(watcher: WatcherId, dep: DepId) {
    let needs_sub = watcher
        .with(|meta| {
            let mut sets = meta.deps.write();
            sets.pending.insert(dep) && !sets.current.contains(&dep)
        })
        .unwrap_or(false);

    if needs_sub {
        cov_mark::hit!(fresh_subscription);
        dep.add_sub(watcher);
    }
}

/// Reconcile the dependency sets after an evaluation.
///
/// Deps present before but unread this time - a conditional branch changed -
/// lose their subscription; then the buffers swap and the retired one is
/// cleared for reuse.
pub fn reconcile_deps(watcher: WatcherId) {
    let removed: Vec<DepId> = watcher
        .with(|meta| {
            let mut sets = meta.deps.write();
            let removed: Vec<DepId> = sets
                .current
                .iter()
                .filter(|dep| !sets.pending.contains(*dep))
                .copied()
                .collect();
            let sets = &mut *sets;
            std::mem::swap(&mut sets.current, &mut sets.pending);
            sets.pending.clear();
            removed
        })
        .unwrap_or_default();

    if !removed.is_empty() {
        cov_mark::hit!(stale_dep_pruned);
    }
    for dep in removed {
        dep.remove_sub(watcher);
    }
}

/// Insert watcher metadata into the arena and return its id.
pub fn watcher_arena_insert(metadata: WatcherMetadata) -> WatcherId {
    let mut arena = WATCHER_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    WatcherId::new(key as u32)
}

/// Remove a watcher from the arena.
pub fn watcher_arena_remove(id: WatcherId) -> Option<WatcherMetadata> {
    let mut arena = WATCHER_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::dep_arena::{DepMetadata, dep_arena_insert, dep_arena_remove};

    #[test]
    fn stale_access_returns_none() {
        // An id whose entry does not exist; same code path as a removed one,
        // but immune to slab index reuse by concurrent tests.
        let id = WatcherId::new(u32::MAX);

        assert!(id.uid().is_none());
        assert!(!id.is_active());
        assert!(id.with_deps(|_| ()).is_none());
        // Running a removed watcher is a no-op.
        assert!(id.run_job().is_ok());
    }

    #[test]
    fn uids_are_monotonic() {
        let a = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));
        let b = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));
        assert!(a.uid().unwrap() < b.uid().unwrap());
        watcher_arena_remove(a);
        watcher_arena_remove(b);
    }

    #[test]
    fn target_guard_restores_on_panic() {
        let outer = WatcherId::new(10);
        let _outer_guard = TargetGuard::new(Some(outer));
        assert_eq!(current_target(), Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _inner = TargetGuard::new(Some(WatcherId::new(20)));
            panic!("test panic");
        });
        assert!(result.is_err());

        // The inner frame was popped during unwinding.
        assert_eq!(current_target(), Some(outer));
    }

    #[test]
    fn none_frame_suppresses_tracking() {
        let _outer = TargetGuard::new(Some(WatcherId::new(3)));
        {
            let _untracked = TargetGuard::new(None);
            assert_eq!(current_target(), None);
        }
        assert_eq!(current_target(), Some(WatcherId::new(3)));
    }

    #[test]
    fn reconcile_prunes_and_swaps() {
        let watcher = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));
        let a = dep_arena_insert(DepMetadata::new());
        let b = dep_arena_insert(DepMetadata::new());

        // First evaluation reads {a, b}.
        add_dep(watcher, a);
        add_dep(watcher, b);
        reconcile_deps(watcher);
        assert_eq!(watcher.with_deps(|d| d.len()), Some(2));
        assert_eq!(a.with_subscribers(|s| s.len()), Some(1));
        assert_eq!(b.with_subscribers(|s| s.len()), Some(1));

        // Second evaluation reads only {a}: b is pruned, a is kept without a
        // redundant re-subscribe.
        cov_mark::check!(stale_dep_pruned);
        add_dep(watcher, a);
        reconcile_deps(watcher);
        assert_eq!(watcher.with_deps(|d| d.len()), Some(1));
        assert_eq!(a.with_subscribers(|s| s.len()), Some(1));
        assert_eq!(b.with_subscribers(|s| s.len()), Some(0));

        dep_arena_remove(a);
        dep_arena_remove(b);
        watcher_arena_remove(watcher);
    }

    #[test]
    fn duplicate_reads_register_once() {
        let watcher = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));
        let dep = dep_arena_insert(DepMetadata::new());

        add_dep(watcher, dep);
        add_dep(watcher, dep);
        add_dep(watcher, dep);
        reconcile_deps(watcher);

        assert_eq!(watcher.with_deps(|d| d.len()), Some(1));
        assert_eq!(dep.with_subscribers(|s| s.len()), Some(1));

        dep_arena_remove(dep);
        watcher_arena_remove(watcher);
    }
}
