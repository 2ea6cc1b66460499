//! Values a watcher can produce, and the change-detection contract.

use std::sync::Arc;

use crate::traverse::Traverse;

/// A value type usable as a watcher result.
///
/// [`same_as`](Watchable::same_as) is the identity/equality check change
/// detection uses for plain values. [`is_container`](Watchable::is_container)
/// marks composite values; a watcher whose evaluator yields a container
/// fires its callback unconditionally, because in-place mutation does not
/// change identity and equality is therefore not a reliable "nothing
/// changed" signal. Keep that conservative behavior: do not substitute deep
/// structural equality for containers.
pub trait Watchable: Traverse {
    /// Whether two results count as the same value.
    fn same_as(&self, other: &Self) -> bool;

    /// Whether this is a composite (container) value.
    fn is_container(&self) -> bool {
        false
    }
}

macro_rules! leaf_watchable {
    ($($ty:ty),* $(,)?) => {$(
        impl Traverse for $ty {}

        impl Watchable for $ty {
            fn same_as(&self, other: &Self) -> bool {
                self == other
            }
        }
    )*};
}

leaf_watchable!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char, (),
    String, &'static str,
);

impl<T: Traverse> Traverse for Vec<T> {
    fn visit_children(&self, visit: &mut dyn FnMut(&dyn Traverse)) {
        // Plain vectors carry no observation record of their own; their
        // elements are still walked so instrumented values inside are found.
        for item in self {
            visit(item);
        }
    }
}

impl<T: Watchable> Watchable for Vec<T> {
    fn same_as(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other)
                .all(|(a, b)| a.same_as(b))
    }

    fn is_container(&self) -> bool {
        true
    }
}

impl<T: Traverse> Traverse for Option<T> {
    fn observer(&self) -> Option<crate::arena::DepId> {
        self.as_ref().and_then(|value| value.observer())
    }

    fn is_sealed(&self) -> bool {
        self.as_ref().is_some_and(|value| value.is_sealed())
    }

    fn visit_children(&self, visit: &mut dyn FnMut(&dyn Traverse)) {
        if let Some(value) = self {
            value.visit_children(visit);
        }
    }
}

impl<T: Watchable> Watchable for Option<T> {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn is_container(&self) -> bool {
        self.as_ref().is_some_and(|value| value.is_container())
    }
}

impl<T: Traverse> Traverse for Arc<T> {
    fn observer(&self) -> Option<crate::arena::DepId> {
        (**self).observer()
    }

    fn is_sealed(&self) -> bool {
        (**self).is_sealed()
    }

    fn visit_children(&self, visit: &mut dyn FnMut(&dyn Traverse)) {
        (**self).visit_children(visit);
    }
}

impl<T: Watchable> Watchable for Arc<T> {
    fn same_as(&self, other: &Self) -> bool {
        // Pointer identity first: two handles to one allocation are the
        // same value even if the contents mutated in place.
        Arc::ptr_eq(self, other) || (**self).same_as(&**other)
    }

    fn is_container(&self) -> bool {
        (**self).is_container()
    }
}
