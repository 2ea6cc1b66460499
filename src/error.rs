//! Error types and the pluggable error reporter.
//!
//! Two failure domains exist, both governed by the watcher's `user` flag:
//! evaluator errors and change-callback errors. With `user` set they are
//! handed to the process-wide [`ErrorReporter`] and the run continues with an
//! undefined value; without it they propagate to the caller as
//! [`WatchError`]. Nothing is retried; the next relevant mutation triggers
//! the next evaluation, which is the only recovery path.

use std::sync::LazyLock;

use parking_lot::RwLock;
use thiserror::Error;

/// Boxed error produced by a user-supplied evaluator or callback.
pub type EvalError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a watcher operation.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The evaluator returned an error.
    #[error("watch evaluator failed: {source}")]
    Eval {
        /// Underlying evaluator error.
        #[source]
        source: EvalError,
    },
    /// The change callback returned an error.
    #[error("watch callback failed: {source}")]
    Callback {
        /// Underlying callback error.
        #[source]
        source: EvalError,
    },
}

/// Sink for errors raised by `user` watchers.
///
/// The default reporter logs through `tracing::error!`. Hosts that surface
/// errors elsewhere (a dev-tools overlay, a crash reporter) install their own
/// with [`set_error_reporter`].
pub trait ErrorReporter: Send + Sync {
    /// Report a non-fatal watcher error. `context` identifies the offending
    /// watcher (its expression or uid).
    fn report(&self, error: &WatchError, context: &str);
}

struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &WatchError, context: &str) {
        tracing::error!(context, error = %error, "watcher error");
    }
}

static REPORTER: LazyLock<RwLock<Box<dyn ErrorReporter>>> =
    LazyLock::new(|| RwLock::new(Box::new(TracingReporter)));

/// Replace the process-wide error reporter.
pub fn set_error_reporter(reporter: Box<dyn ErrorReporter>) {
    *REPORTER.write() = reporter;
}

/// Route an error through the installed reporter.
pub(crate) fn report_error(error: &WatchError, context: &str) {
    REPORTER.read().report(error, context);
}
