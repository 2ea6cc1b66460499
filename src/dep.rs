//! Publisher handle: the subscriber-list container a data source owns.

use crate::arena::dep_arena::{DepMetadata, dep_arena_insert, dep_arena_remove};
use crate::arena::{DepId, WatcherId};
use crate::error::WatchError;

/// Owning handle over one publisher.
///
/// A `Dep` is pure metadata: the observed value stays wherever the
/// instrumentation layer keeps it. An instrumented getter calls
/// [`depend`](Dep::depend) on a tracked read; an instrumented setter calls
/// [`notify`](Dep::notify) after a write.
///
/// ```ignore
/// struct Field {
///     value: i64,
///     dep: Dep,
/// }
///
/// impl Field {
///     fn get(&self) -> i64 {
///         self.dep.depend(); // subscribe the in-flight watcher, if any
///         self.value
///     }
///
///     fn set(&mut self, value: i64) -> Result<(), WatchError> {
///         self.value = value;
///         self.dep.notify()
///     }
/// }
/// ```
pub struct Dep {
    id: DepId,
}

impl Dep {
    /// Create a new publisher and allocate it in the arena.
    pub fn new() -> Self {
        Self {
            id: dep_arena_insert(DepMetadata::new()),
        }
    }

    /// The arena id of this publisher. Stable for the life of the handle;
    /// this is the identity deep traversal deduplicates on.
    pub fn id(&self) -> DepId {
        self.id
    }

    /// Register the watcher currently collecting dependencies (if any) as a
    /// subscriber. No-op outside an evaluation.
    pub fn depend(&self) {
        self.id.depend();
    }

    /// Notify all subscribed watchers that the underlying value changed.
    pub fn notify(&self) -> Result<(), WatchError> {
        self.id.notify()
    }

    /// Number of watchers currently subscribed.
    pub fn subscriber_count(&self) -> usize {
        self.id.with_subscribers(|subs| subs.len()).unwrap_or(0)
    }

    /// Whether a specific watcher is subscribed.
    pub(crate) fn has_subscriber(&self, watcher: WatcherId) -> bool {
        self.id
            .with_subscribers(|subs| subs.contains(&watcher))
            .unwrap_or(false)
    }
}

impl Default for Dep {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dep {
    fn drop(&mut self) {
        // Drop the edge from both directions: every subscribed watcher
        // forgets this dep, then the arena entry goes away.
        let subscribers: Vec<WatcherId> = self
            .id
            .with_subscribers(|subs| subs.iter().copied().collect())
            .unwrap_or_default();
        for watcher in subscribers {
            watcher.forget_dep(self.id);
        }
        dep_arena_remove(self.id);
    }
}

// Single-ownership model: cloning the handle would double-free the arena
// entry on drop. Share a Dep via Arc or by passing its DepId.
