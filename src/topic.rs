//! Hierarchical topic matching.
//!
//! Topics are `/`-separated levels. Subscription patterns may use two wildcards:
//!
//! - `+` matches exactly one level
//! - `#` matches any number of remaining levels (including none) and is only
//!   valid as the final level of a pattern
//!
//! A pattern with `#` anywhere but the last level never matches anything.
//!
//! ```
//! use topic_socket::topic::matches;
//!
//! assert!(matches("room/+/msg", "room/1/msg"));
//! assert!(matches("room/#", "room/1/msg/edit"));
//! assert!(!matches("room/+", "room"));
//! ```

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Returns `true` when `topic` is matched by `pattern`.
#[must_use]
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern_levels: Vec<&str> = pattern.split(LEVEL_SEPARATOR).collect();
    let topic_levels: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();

    for (index, level) in pattern_levels.iter().enumerate() {
        if *level == MULTI_LEVEL {
            return index + 1 == pattern_levels.len();
        }

        let Some(topic_level) = topic_levels.get(index) else {
            return false;
        };

        if *level != SINGLE_LEVEL && level != topic_level {
            return false;
        }
    }

    pattern_levels.len() == topic_levels.len()
}

/// Returns `true` if any pattern in `patterns` matches `topic`.
#[must_use]
pub fn any_match<S: AsRef<str>>(patterns: &[S], topic: &str) -> bool {
    patterns.iter().any(|pattern| matches(pattern.as_ref(), topic))
}

/// Returns `true` if every pattern in `patterns` matches `topic`.
///
/// An empty list never matches.
#[must_use]
pub fn all_match<S: AsRef<str>>(patterns: &[S], topic: &str) -> bool {
    !patterns.is_empty() && patterns.iter().all(|pattern| matches(pattern.as_ref(), topic))
}

/// Returns the patterns in `patterns` that match `topic`, in their original order.
#[must_use]
pub fn matching<'p, S: AsRef<str>>(patterns: &'p [S], topic: &str) -> Vec<&'p str> {
    patterns
        .iter()
        .map(AsRef::as_ref)
        .filter(|pattern| matches(pattern, topic))
        .collect()
}
