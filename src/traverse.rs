//! Deep-traversal forcer.
//!
//! Deep watching means a computation depends on every value currently
//! reachable inside its result, not just the top-level reference. The forcer
//! achieves that by reading every nested element/field while the watcher is
//! still the active evaluation context: each tracked read fires the
//! instrumented getter, which subscribes the watcher to that value's dep.

use std::cell::RefCell;

use crate::arena::DepId;
use crate::hash::FastIndexSet;

/// A value the deep forcer can walk. Implemented by the instrumentation
/// layer for observed containers; every method defaults to leaf behavior, so
/// plain values need no code.
pub trait Traverse {
    /// The dep attached by the observation layer, if this value is
    /// instrumented. Traversal deduplicates shared subtrees and breaks
    /// cycles on this identity; values without one cannot be deduplicated.
    fn observer(&self) -> Option<DepId> {
        None
    }

    /// Frozen or opaque values the forcer must never enter (for example
    /// host-internal render nodes). Sealed values are leaves even if they
    /// carry children.
    fn is_sealed(&self) -> bool {
        false
    }

    /// Perform a tracked read of each child and hand it to `visit`. The read
    /// itself is what subscribes the in-flight watcher; implementations call
    /// the child's instrumented getter (or `Dep::depend`) before visiting.
    fn visit_children(&self, visit: &mut dyn FnMut(&dyn Traverse)) {
        let _ = visit;
    }
}

thread_local! {
    // Reusable visited-set buffer. Scoped to one top-level traverse call;
    // taken out of the slot for the duration of the walk so tracked reads
    // can run arbitrary user code without a live RefCell borrow.
    static SEEN: RefCell<FastIndexSet<DepId>> = RefCell::new(FastIndexSet::default());
}

/// Force dependency discovery across the entire nested value.
///
/// Visits every reachable child depth-first. Subtrees whose attached dep was
/// already seen in this call are skipped, which both deduplicates aliased
/// substructure and terminates cycles. The visited set is transient: it is
/// cleared when the call returns, never cached across calls.
pub fn traverse(value: &dyn Traverse) {
    let mut seen = SEEN.with(|slot| std::mem::take(&mut *slot.borrow_mut()));
    visit(value, &mut seen);
    seen.clear();
    SEEN.with(|slot| *slot.borrow_mut() = seen);
}

fn visit(value: &dyn Traverse, seen: &mut FastIndexSet<DepId>) {
    if value.is_sealed() {
        return;
    }
    if let Some(dep) = value.observer() {
        if !seen.insert(dep) {
            cov_mark::hit!(traverse_dedup_skip);
            return;
        }
    }
    value.visit_children(&mut |child| visit(child, seen));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use crate::dep::Dep;

    // Minimal instrumented tree: each node owns a dep, children behind a
    // lock so cycles can be wired up after construction.
    struct Node {
        dep: Dep,
        reads: AtomicUsize,
        children: RwLock<Vec<Arc<Node>>>,
        sealed: bool,
    }

    impl Node {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dep: Dep::new(),
                reads: AtomicUsize::new(0),
                children: RwLock::new(Vec::new()),
                sealed: false,
            })
        }

        fn sealed() -> Arc<Self> {
            Arc::new(Self {
                dep: Dep::new(),
                reads: AtomicUsize::new(0),
                children: RwLock::new(Vec::new()),
                sealed: true,
            })
        }
    }

    impl Traverse for Node {
        fn observer(&self) -> Option<DepId> {
            Some(self.dep.id())
        }

        fn is_sealed(&self) -> bool {
            self.sealed
        }

        fn visit_children(&self, visit: &mut dyn FnMut(&dyn Traverse)) {
            for child in self.children.read().iter() {
                // The tracked read.
                child.dep.depend();
                child.reads.fetch_add(1, Ordering::Relaxed);
                visit(&**child);
            }
        }
    }

    #[test]
    fn traversal_reads_every_nested_child() {
        let root = Node::new();
        let mid = Node::new();
        let leaf = Node::new();
        mid.children.write().push(leaf.clone());
        root.children.write().push(mid.clone());

        traverse(&*root);

        assert_eq!(mid.reads.load(Ordering::Relaxed), 1);
        assert_eq!(leaf.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shared_subtree_is_visited_once() {
        let root = Node::new();
        let shared = Node::new();
        let inner = Node::new();
        shared.children.write().push(inner.clone());
        // Two aliases of the same subtree under one root.
        root.children.write().push(shared.clone());
        root.children.write().push(shared.clone());

        cov_mark::check!(traverse_dedup_skip);
        traverse(&*root);

        // The alias is read twice (both reads must fire) but only descended
        // into once.
        assert_eq!(shared.reads.load(Ordering::Relaxed), 2);
        assert_eq!(inner.reads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cyclic_graph_terminates() {
        let a = Node::new();
        let b = Node::new();
        a.children.write().push(b.clone());
        b.children.write().push(a.clone());

        traverse(&*a);

        assert_eq!(b.reads.load(Ordering::Relaxed), 1);
        assert_eq!(a.reads.load(Ordering::Relaxed), 1);

        // Break the cycle so the Arcs can drop.
        a.children.write().clear();
        b.children.write().clear();
    }

    #[test]
    fn sealed_values_are_leaves() {
        let root = Node::new();
        let sealed = Node::sealed();
        let hidden = Node::new();
        sealed.children.write().push(hidden.clone());
        root.children.write().push(sealed.clone());

        traverse(&*root);

        assert_eq!(sealed.reads.load(Ordering::Relaxed), 1);
        assert_eq!(hidden.reads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn visited_set_is_transient_across_calls() {
        let root = Node::new();
        let child = Node::new();
        root.children.write().push(child.clone());

        traverse(&*root);
        traverse(&*root);

        // A fresh call re-reads everything; the set is not a cache.
        assert_eq!(child.reads.load(Ordering::Relaxed), 2);
    }
}
