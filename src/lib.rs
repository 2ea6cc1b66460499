#![deny(missing_docs)]

//! Pull-driven dependency tracking and change propagation.
//!
//! Watchers evaluate arbitrary expressions over your data. While an
//! expression runs, every instrumented read registers itself as a
//! dependency; when any of those deps later changes, the watcher re-runs and
//! fires its callback with the new and previous values. Deps are lightweight
//! metadata (4 bytes) while your values stay in your structs.
//!
//! # Quick Start
//!
//! ```ignore
//! use pullwatch::{Dep, Watcher, WatchOptions, flush_queue};
//!
//! struct Counter {
//!     value: i64,
//!     dep: Dep,  // Just 4 bytes of metadata
//! }
//!
//! impl Counter {
//!     fn get(&self) -> i64 {
//!         self.dep.depend();  // Register the evaluating watcher
//!         self.value
//!     }
//!
//!     fn set(&mut self, v: i64) -> Result<(), WatchError> {
//!         self.value = v;
//!         self.dep.notify()   // Invalidate subscribers
//!     }
//! }
//!
//! // Dependencies are discovered by running the expression
//! let watcher = Watcher::new(
//!     || counter.get() * 2,
//!     |new, old| println!("{old:?} -> {new:?}"),
//!     WatchOptions::default(),
//! )?;
//!
//! counter.set(3)?;   // Queues the watcher
//! counter.set(4)?;   // Already queued, deduplicated
//! flush_queue()?;    // Callback fires once, in creation order
//! ```
//!
//! # Core Types
//!
//! - [`Dep`] - Reactive marker owned by a piece of data. Call
//!   [`depend()`](Dep::depend) on read, [`notify()`](Dep::notify) on write.
//! - [`Watcher<T>`] - Tracked computation. Re-runs when any dep it read
//!   changes, firing a `(new, old)` callback when the value differs.
//! - [`WatchOptions`] - Policy flags: `deep` (track a whole subtree), `user`
//!   (report errors instead of propagating), `lazy` (evaluate on demand),
//!   `sync` (re-run inline without the scheduler).
//!
//! # Deep watching
//!
//! ```ignore
//! // Implement Traverse for your observed types, then:
//! let watcher = Watcher::new(
//!     move || tree.root(),
//!     |new, old| { ... },
//!     WatchOptions { deep: true, ..Default::default() },
//! )?;
//! // Every dep in the subtree is now a dependency; interior mutation
//! // anywhere below the root re-fires the callback.
//! ```
//!
//! # Processing updates
//!
//! ```ignore
//! flush_queue()?;         // Run all queued watchers now, ordered by creation
//! is_flush_pending();     // Check whether anything is queued
//! untracked(|| { ... });  // Run without recording dependencies
//! ```
//!
//! # Errors
//!
//! Fallible evaluators and callbacks go through [`Watcher::with_results`].
//! Without the `user` flag an error surfaces as a [`WatchError`] from
//! whichever call triggered the run (`notify`, `flush_queue`, `evaluate`).
//! With `user` set, errors are handed to the global [`ErrorReporter`]
//! (default: a `tracing` event) and the watcher keeps going.

// Internal modules
pub(crate) mod arena;
mod dep;
mod error;
mod hash;
mod path;
mod scheduler;
mod traverse;
mod value;
mod watcher;

// Core types
pub use dep::Dep;
pub use watcher::{WatchOptions, Watcher};

// Dependency identity, exposed for introspection
pub use arena::DepId;

// Key functions
pub use scheduler::{flush_queue, is_flush_pending};
pub use watcher::untracked;

// Deep watching and change detection
pub use traverse::{Traverse, traverse};
pub use value::Watchable;

// Path expressions
pub use path::{Getter, PathResolver, parse_path};

// Error handling
pub use error::{ErrorReporter, EvalError, WatchError, set_error_reporter};
