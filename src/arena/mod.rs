// Arena-based storage for the reactive graph's metadata.
//
// Two arenas back the crate:
// - Dep arena: per-data-source subscriber sets (DepMetadata)
// - Watcher arena: per-computation bookkeeping (WatcherMetadata: uid, flags,
//   dependency sets, type-erased run job)
//
// Both use global static slabs behind parking_lot RwLocks. DepId and
// WatcherId are lightweight newtypes indexing into the slabs; accessing a
// removed entry returns None rather than panicking.

// watcher_arena is declared first because dep_arena depends on WatcherId.
pub mod watcher_arena;

pub mod dep_arena;

pub use dep_arena::DepId;
pub use watcher_arena::{
    TargetGuard, WatchFlags, WatcherId, WatcherMetadata, reconcile_deps, watcher_arena_insert,
    watcher_arena_remove,
};
