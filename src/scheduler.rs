//! Batched update scheduler.
//!
//! `update()` on a non-lazy, non-sync watcher does not run it; it enqueues
//! the watcher here. One [`flush_queue`] pass then runs every queued watcher
//! exactly once, in creation order (ascending uid), so parents run before
//! the dependents they created and many synchronous mutations in one tick
//! collapse into one re-evaluation per affected watcher.
//!
//! The queue is thread-local: the engine's cooperative model is per-thread,
//! and a mutation always enqueues on the thread that performed it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::arena::WatcherId;
use crate::error::WatchError;
use crate::hash::{FastHashBuilder, FastIndexSet};
use crate::watcher::run_watcher;

/// Runs of one watcher within a single flush before the flush is declared
/// circular and aborted.
const MAX_UPDATE_COUNT: u32 = 100;

thread_local! {
    static QUEUE: RefCell<FastIndexSet<WatcherId>> = RefCell::new(FastIndexSet::default());
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
}

/// Enqueue a watcher for the next flush. Deduplicating: a watcher already
/// queued stays queued once. Enqueueing during a flush is observed by that
/// same flush.
pub(crate) fn queue_watcher(watcher: WatcherId) {
    QUEUE.with(|queue| {
        queue.borrow_mut().insert(watcher);
    });
}

/// Drop a watcher from the queue (teardown path). Queue order is irrelevant
/// between flushes, so swap-removal is fine.
pub(crate) fn remove_queued(watcher: WatcherId) {
    QUEUE.with(|queue| {
        queue.borrow_mut().swap_remove(&watcher);
    });
}

/// Whether any watcher is waiting for a flush on this thread.
pub fn is_flush_pending() -> bool {
    QUEUE.with(|queue| !queue.borrow().is_empty())
}

struct FlushingGuard;

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        FLUSHING.set(false);
    }
}

/// Run every queued watcher once and return how many ran.
///
/// Fixed-point pass: each drained batch is sorted by uid ascending and run;
/// watchers enqueued by those runs form the next batch of the same flush.
/// The optional `before` hook fires immediately prior to each run. A
/// non-`user` watcher error aborts the flush and propagates; watchers
/// re-queued more than [`MAX_UPDATE_COUNT`] times in one flush indicate an
/// update loop (a callback mutating its own dependency), which is logged and
/// aborts the flush. Re-entrant calls are no-ops.
pub fn flush_queue() -> Result<usize, WatchError> {
    if FLUSHING.get() {
        return Ok(0);
    }
    FLUSHING.set(true);
    let _guard = FlushingGuard;

    let mut ran = 0usize;
    let mut circular: HashMap<WatcherId, u32, FastHashBuilder> = HashMap::default();
    let mut batch: Vec<WatcherId> = Vec::new();

    loop {
        batch.clear();
        QUEUE.with(|queue| batch.extend(queue.borrow_mut().drain(..)));
        if batch.is_empty() {
            break;
        }
        batch.sort_unstable_by_key(|watcher| watcher.uid().unwrap_or(u64::MAX));

        for (index, &watcher) in batch.iter().enumerate() {
            let count = circular.entry(watcher).or_insert(0);
            *count += 1;
            if *count > MAX_UPDATE_COUNT {
                cov_mark::hit!(circular_update_aborted);
                tracing::error!(
                    uid = watcher.uid(),
                    "infinite update loop detected; aborting flush"
                );
                return Ok(ran);
            }

            watcher.call_before();
            if let Err(err) = run_watcher(watcher) {
                // The rest of the batch has been drained but not run; put
                // it back so those watchers stay pending for the next flush
                // instead of going stale while still subscribed.
                cov_mark::hit!(flush_error_requeues_remainder);
                for &pending in &batch[index + 1..] {
                    queue_watcher(pending);
                }
                return Err(err);
            }
            ran += 1;
        }
    }

    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{WatchFlags, WatcherMetadata, watcher_arena_insert, watcher_arena_remove};

    #[test]
    fn queue_deduplicates() {
        let watcher = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));

        queue_watcher(watcher);
        queue_watcher(watcher);
        queue_watcher(watcher);
        assert!(is_flush_pending());

        // No job installed: the run is a no-op, but it is attempted once.
        let ran = flush_queue().unwrap();
        assert_eq!(ran, 1);
        assert!(!is_flush_pending());

        watcher_arena_remove(watcher);
    }

    #[test]
    fn torn_down_watcher_in_queue_is_a_noop() {
        let watcher = watcher_arena_insert(WatcherMetadata::new(WatchFlags::default()));
        queue_watcher(watcher);
        remove_queued(watcher);
        assert!(!is_flush_pending());
        watcher_arena_remove(watcher);
    }
}
