//! Path expressions and the resolver seam.
//!
//! A watch target given as a dot-delimited string ("user.profile.name") is
//! turned into an evaluator by a host-provided [`PathResolver`]; this module
//! only validates and splits the syntax. How a segment list becomes a tracked
//! read of host state is the resolver's business.

use crate::error::EvalError;

/// Boxed evaluator, as produced by a resolver.
pub type Getter<T> = Box<dyn FnMut() -> Result<T, EvalError> + Send>;

/// Turns a path string into an evaluator over host state.
///
/// Returning `None` means the path cannot be watched; the watcher falls back
/// to a no-op evaluator with a non-fatal warning.
pub trait PathResolver<T> {
    /// Resolve `path` to an evaluator, or `None` if it cannot be resolved.
    fn resolve(&self, path: &str) -> Option<Getter<T>>;
}

/// Split a watch path into its segments.
///
/// Accepts only simple dotted paths: alphanumerics, `_` and `$`. Anything
/// else (indexing, calls, operators) is not a path and yields `None`.
pub fn parse_path(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return None;
    }
    let valid = path
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '.');
    if !valid {
        return None;
    }
    let segments: Vec<String> = path.split('.').map(str::to_owned).collect();
    if segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_paths_split() {
        assert_eq!(parse_path("a"), Some(vec!["a".to_owned()]));
        assert_eq!(
            parse_path("user.$data.name_1"),
            Some(vec![
                "user".to_owned(),
                "$data".to_owned(),
                "name_1".to_owned()
            ])
        );
    }

    #[test]
    fn expressions_are_rejected() {
        assert_eq!(parse_path(""), None);
        assert_eq!(parse_path("a + b"), None);
        assert_eq!(parse_path("list[0]"), None);
        assert_eq!(parse_path("a..b"), None);
        assert_eq!(parse_path(".a"), None);
    }
}
