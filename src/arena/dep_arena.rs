// Dep arena - storage for publisher metadata.
//
// A dep is the publisher side of the graph: it owns nothing but the set of
// watchers subscribed to it. The subscriber set is an IndexSet so that
// membership tests, O(1) removal and deterministic iteration all come from
// one container.

use parking_lot::RwLock;
use slab::Slab;

use crate::error::WatchError;
use crate::hash::FastIndexSet;

use super::watcher_arena::{self, WatcherId};

/// Global dep arena - stores all publisher metadata.
static DEP_ARENA: RwLock<Slab<DepMetadata>> = RwLock::new(Slab::new());

/// Unique identifier for a publisher in the arena.
///
/// Zero-cost wrapper around a slab index. When the owning [`crate::Dep`] is
/// dropped the entry is removed and the id goes stale; stale access returns
/// `None` from [`DepId::with`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DepId(u32);

impl DepId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the dep metadata with a closure. `None` if the dep is gone.
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&DepMetadata) -> R,
    {
        let arena = DEP_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Register the watcher currently collecting dependencies (if any) as a
    /// subscriber of this dep.
    ///
    /// This is the entry point an instrumented getter calls on a tracked
    /// read. Registration goes through the watcher side so the pending-set /
    /// previous-set two-level check applies: a dep read twice in one
    /// evaluation is recorded once, and a dep still subscribed from the
    /// prior evaluation is not re-subscribed.
    pub fn depend(self) {
        if let Some(target) = watcher_arena::current_target() {
            watcher_arena::add_dep(target, self);
        }
    }

    /// Notify every subscribed watcher that this dep's value changed.
    ///
    /// Subscribers are updated in creation order (ascending uid) so that
    /// watchers created earlier - typically parents - observe the change
    /// first. Each watcher's `update()` then applies its own policy: lazy
    /// watchers are marked dirty, sync watchers run inline, everything else
    /// is queued with the scheduler.
    ///
    /// A non-`user` sync watcher that fails during its inline run propagates
    /// the error to the caller of `notify`.
    pub fn notify(self) -> Result<(), WatchError> {
        let mut subs: Vec<(u64, WatcherId)> = self
            .with_subscribers(|subs| {
                subs.iter()
                    .map(|w| (w.uid().unwrap_or(u64::MAX), *w))
                    .collect()
            })
            .unwrap_or_default();
        subs.sort_unstable_by_key(|(uid, _)| *uid);

        for (_, watcher) in subs {
            crate::watcher::update_watcher(watcher)?;
        }
        Ok(())
    }

    /// Add a subscriber. Deduplicated by the IndexSet.
    pub(crate) fn add_sub(self, watcher: WatcherId) {
        self.with(|metadata| {
            metadata.subscribers.write().insert(watcher);
        });
    }

    /// Remove a subscriber.
    pub(crate) fn remove_sub(self, watcher: WatcherId) {
        self.with(|metadata| {
            metadata.subscribers.write().swap_remove(&watcher);
        });
    }

    /// Execute a closure with the subscriber set of this dep.
    pub(crate) fn with_subscribers<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&FastIndexSet<WatcherId>) -> R,
    {
        self.with(|metadata| {
            let subscribers = metadata.subscribers.read();
            f(&subscribers)
        })
    }
}

/// Metadata for a publisher stored in the arena: just its subscriber set.
///
/// The observed value itself lives with the instrumentation layer; the arena
/// only carries the edges of the graph.
#[derive(Debug, Default)]
pub struct DepMetadata {
    pub(crate) subscribers: RwLock<FastIndexSet<WatcherId>>,
}

impl DepMetadata {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Insert dep metadata into the arena and return its id.
pub(crate) fn dep_arena_insert(metadata: DepMetadata) -> DepId {
    let mut arena = DEP_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    DepId::new(key as u32)
}

/// Remove a dep from the arena.
pub(crate) fn dep_arena_remove(id: DepId) -> Option<DepMetadata> {
    let mut arena = DEP_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}
