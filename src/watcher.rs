//! Computation node: evaluates an expression, records exactly which deps the
//! evaluation read, subscribes to those, and re-runs on invalidation.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::arena::watcher_arena::Job;
use crate::arena::{
    DepId, TargetGuard, WatchFlags, WatcherId, WatcherMetadata, reconcile_deps,
    watcher_arena_insert, watcher_arena_remove,
};
use crate::error::{EvalError, WatchError, report_error};
use crate::path::PathResolver;
use crate::scheduler;
use crate::traverse::traverse;
use crate::value::Watchable;

/// Configuration bag for a watcher.
///
/// The four policy flags are independent binary axes; `update()` and `run()`
/// dispatch on them with straight-line checks. `before` is an optional hook
/// the scheduler invokes immediately before a queued run (hosts use it to
/// fire "about to re-render" style lifecycle events).
///
/// ```ignore
/// let options = WatchOptions { deep: true, ..Default::default() };
/// ```
#[derive(Default)]
pub struct WatchOptions {
    /// Force full-subtree dependency tracking via deep traversal.
    pub deep: bool,
    /// Treat evaluator/callback errors as recoverable: report, don't
    /// propagate.
    pub user: bool,
    /// Defer the first evaluation; recompute on demand and only mark stale
    /// on notification.
    pub lazy: bool,
    /// Bypass the scheduler and re-run inline on notification.
    pub sync: bool,
    /// Hook invoked immediately before a scheduled run.
    pub before: Option<Box<dyn FnMut() + Send>>,
}

/// Typed half of a watcher. Lives outside the arena; the arena job closure
/// holds an `Arc` of this and drives the erased run cycle through it.
struct WatcherInner<T> {
    id: WatcherId,
    value: RwLock<Option<T>>,
    getter: Mutex<Box<dyn FnMut() -> Result<T, EvalError> + Send>>,
    #[allow(clippy::type_complexity)]
    callback: Mutex<Box<dyn FnMut(Option<&T>, Option<&T>) -> Result<(), EvalError> + Send>>,
}

impl<T> WatcherInner<T>
where
    T: Watchable + Clone + Send + Sync + 'static,
{
    /// The dependency-discovery protocol: push this watcher as the
    /// evaluation context, run the evaluator, then - regardless of outcome -
    /// deep-traverse the result when `deep`, pop the context (RAII) and
    /// reconcile the dependency sets.
    ///
    /// `Ok(None)` is the undefined value: a reported `user`-mode error.
    fn track_eval(&self) -> Result<Option<T>, WatchError> {
        let flags = self.id.flags().unwrap_or_default();

        let target = TargetGuard::new(Some(self.id));
        let outcome = {
            let mut getter = self.getter.lock();
            (*getter)()
        };
        if flags.deep {
            if let Ok(value) = &outcome {
                traverse(value);
            }
        }
        drop(target);
        reconcile_deps(self.id);

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(source) => {
                let err = WatchError::Eval { source };
                if flags.user {
                    report_error(&err, &watcher_context(self.id));
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Execution entry point for the scheduler and for sync updates.
    ///
    /// Re-evaluates, then fires the change callback if the value differs by
    /// [`Watchable::same_as`], or the new value is a container, or the
    /// watcher is deep - container and deep results fire unconditionally
    /// because in-place mutation leaves identity untouched.
    fn run(&self) -> Result<(), WatchError> {
        if !self.id.is_active() {
            return Ok(());
        }
        let flags = self.id.flags().unwrap_or_default();
        let new = self.track_eval()?;

        let fire = {
            let current = self.value.read();
            let same = match (new.as_ref(), current.as_ref()) {
                (Some(a), Some(b)) => a.same_as(b),
                (None, None) => true,
                _ => false,
            };
            !same || new.as_ref().is_some_and(Watchable::is_container) || flags.deep
        };
        if !fire {
            return Ok(());
        }

        let old = {
            let mut slot = self.value.write();
            std::mem::replace(&mut *slot, new.clone())
        };
        let result = {
            let mut callback = self.callback.lock();
            (*callback)(new.as_ref(), old.as_ref())
        };
        match result {
            Ok(()) => Ok(()),
            Err(source) => {
                let err = WatchError::Callback { source };
                if flags.user {
                    report_error(&err, &watcher_context(self.id));
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn watcher_context(id: WatcherId) -> String {
    match id.uid() {
        Some(uid) => format!("watcher #{uid}"),
        None => "watcher (torn down)".to_owned(),
    }
}

/// Notification entry point: dispatch a dep change to a watcher by policy.
///
/// Lazy watchers are only marked stale; sync watchers run inline on the
/// calling stack (errors propagate to the notifier); everything else is
/// handed to the scheduler, which deduplicates repeated updates before the
/// next flush.
pub(crate) fn update_watcher(watcher: WatcherId) -> Result<(), WatchError> {
    let Some(flags) = watcher.flags() else {
        return Ok(());
    };
    if flags.lazy {
        watcher.set_dirty(true);
        Ok(())
    } else if flags.sync {
        run_watcher(watcher)
    } else {
        scheduler::queue_watcher(watcher);
        Ok(())
    }
}

/// Run a watcher by id through its erased job. Safe for torn-down ids.
pub(crate) fn run_watcher(watcher: WatcherId) -> Result<(), WatchError> {
    watcher.run_job()
}

/// An observer that evaluates an expression and re-runs it when any dep the
/// evaluation read later changes.
///
/// Dropping the handle tears the watcher down: every subscription is removed
/// in both directions and any already-queued run becomes a no-op.
///
/// ```ignore
/// let field = Arc::new(ObservedField::new(1));
/// let source = field.clone();
/// let watcher = Watcher::new(
///     move || source.get() * 2,
///     |new, old| println!("{old:?} -> {new:?}"),
///     WatchOptions::default(),
/// )?;
///
/// field.set(3)?;        // marks the watcher pending
/// flush_queue()?;       // callback fires once: Some(2) -> Some(6)
/// ```
pub struct Watcher<T> {
    inner: Arc<WatcherInner<T>>,
}

impl<T> Watcher<T>
where
    T: Watchable + Clone + Send + Sync + 'static,
{
    /// Create a watcher over an infallible evaluator.
    ///
    /// Unless `lazy`, the evaluator runs once here to seed the value and
    /// discover the initial dependency set.
    pub fn new<G, C>(mut getter: G, mut callback: C, options: WatchOptions) -> Result<Self, WatchError>
    where
        G: FnMut() -> T + Send + 'static,
        C: FnMut(Option<&T>, Option<&T>) + Send + 'static,
    {
        Self::with_results(
            move || Ok(getter()),
            move |new, old| {
                callback(new, old);
                Ok(())
            },
            options,
        )
    }

    /// Create a watcher whose evaluator and callback are fallible.
    ///
    /// Errors follow the `user` policy: reported non-fatally when set,
    /// propagated to the caller (here, or from `notify`/`flush_queue`)
    /// otherwise.
    pub fn with_results<G, C>(getter: G, callback: C, options: WatchOptions) -> Result<Self, WatchError>
    where
        G: FnMut() -> Result<T, EvalError> + Send + 'static,
        C: FnMut(Option<&T>, Option<&T>) -> Result<(), EvalError> + Send + 'static,
    {
        let WatchOptions {
            deep,
            user,
            lazy,
            sync,
            before,
        } = options;
        let flags = WatchFlags {
            deep,
            user,
            lazy,
            sync,
        };

        let id = watcher_arena_insert(WatcherMetadata::new(flags));
        if let Some(hook) = before {
            id.set_before(hook);
        }

        let inner = Arc::new(WatcherInner {
            id,
            value: RwLock::new(None),
            getter: Mutex::new(Box::new(getter) as Box<dyn FnMut() -> Result<T, EvalError> + Send>),
            callback: Mutex::new(
                Box::new(callback)
                    as Box<dyn FnMut(Option<&T>, Option<&T>) -> Result<(), EvalError> + Send>,
            ),
        });
        let job_inner = Arc::clone(&inner);
        id.install_job(Box::new(move || job_inner.run()) as Job);

        let watcher = Self { inner };
        if !lazy {
            // Initial evaluation seeds last_value and the dependency set.
            // On a (non-user) error the handle is dropped by `?`, which
            // tears the half-built watcher down.
            let seed = watcher.inner.track_eval()?;
            *watcher.inner.value.write() = seed;
        }
        Ok(watcher)
    }

    /// Create a watcher over a dot-delimited path expression.
    ///
    /// The resolver turns the path into an evaluator; if it cannot, the
    /// watcher is constructed anyway with a warning and a no-op evaluator
    /// yielding `T::default()` - it will simply never observe anything.
    pub fn from_path<C>(
        resolver: &dyn PathResolver<T>,
        path: &str,
        mut callback: C,
        options: WatchOptions,
    ) -> Result<Self, WatchError>
    where
        T: Default,
        C: FnMut(Option<&T>, Option<&T>) + Send + 'static,
    {
        let getter = resolver.resolve(path).unwrap_or_else(|| {
            tracing::warn!(path, "failed to resolve watch path; watcher will never update");
            Box::new(|| Ok(T::default()))
        });
        Self::with_results(
            getter,
            move |new, old| {
                callback(new, old);
                Ok(())
            },
            options,
        )
    }

    /// The arena id of this watcher.
    pub(crate) fn id(&self) -> WatcherId {
        self.inner.id
    }

    /// Monotonic creation id; the scheduler's ordering key.
    pub fn uid(&self) -> u64 {
        self.inner.id.uid().unwrap_or(u64::MAX)
    }

    /// Clone of the most recently computed value. `None` before the first
    /// evaluation of a lazy watcher, or after a reported `user` error.
    pub fn value(&self) -> Option<T> {
        self.inner.value.read().clone()
    }

    /// Whether a lazy watcher's cached value is stale.
    pub fn is_dirty(&self) -> bool {
        self.inner.id.is_dirty()
    }

    /// False after teardown.
    pub fn is_active(&self) -> bool {
        self.inner.id.is_active()
    }

    /// Apply this watcher's update policy as if a dep had notified it.
    pub fn update(&self) -> Result<(), WatchError> {
        update_watcher(self.inner.id)
    }

    /// Force an evaluation and cache the result, clearing `dirty`.
    ///
    /// This is how a lazy watcher's value is materialized on demand. A
    /// no-op after teardown: re-evaluating would re-subscribe to deps the
    /// teardown just detached.
    pub fn evaluate(&self) -> Result<(), WatchError> {
        if !self.inner.id.is_active() {
            return Ok(());
        }
        let value = self.inner.track_eval()?;
        *self.inner.value.write() = value;
        self.inner.id.set_dirty(false);
        Ok(())
    }

    /// Register the *currently evaluating* watcher (not this one) with every
    /// dep this watcher holds.
    ///
    /// A lazy watcher read from inside another evaluation uses this to
    /// propagate its dependencies upward without re-running its evaluator.
    pub fn depend(&self) {
        let deps: Vec<DepId> = self
            .inner
            .id
            .with_deps(|deps| deps.iter().copied().collect())
            .unwrap_or_default();
        for dep in deps {
            dep.depend();
        }
    }

    /// Tear the watcher down: unsubscribe from every dep, clear both
    /// dependency buffers, drop any queued run. Idempotent; the watcher is
    /// permanently inactive afterwards and later `update()` calls are
    /// no-ops.
    pub fn teardown(&self) {
        teardown_watcher(self.inner.id);
    }

    /// Snapshot of the current dependency set.
    pub fn dep_ids(&self) -> Vec<DepId> {
        self.inner
            .id
            .with_deps(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }
}

pub(crate) fn teardown_watcher(watcher: WatcherId) {
    if !watcher.deactivate() {
        return;
    }
    scheduler::remove_queued(watcher);
    for dep in watcher.detach_all_deps() {
        dep.remove_sub(watcher);
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        teardown_watcher(self.inner.id);
        // The arena entry owns the job closure (and through it the second
        // Arc of the inner); removing it frees both.
        watcher_arena_remove(self.inner.id);
    }
}

/// Run a closure without dependency tracking.
///
/// Tracked reads inside `f` are attributed to nobody: a `None` frame is
/// pushed on the evaluation-context stack for the duration of the call.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = TargetGuard::new(None);
    f()
}
