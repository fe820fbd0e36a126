//! Topic matching
//!
//! Topics are `/`-delimited level sequences. Concrete topics (used for
//! publish) are all-literal; patterns (used for subscribe) may contain `+`
//! for exactly one level and `#` for all remaining levels, including none.
//! `#` is only legal as the last level, and a wildcard must occupy a whole
//! level.

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL: &str = "+";
pub const MULTI_LEVEL: &str = "#";

/// Returns true if the concrete `topic` is matched by `pattern`.
///
/// Matching is case-sensitive and level-count aware. An invalid pattern
/// (a `#` that is not last) never matches.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return pattern_levels.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A subscription pattern is valid when it is non-empty, every wildcard fills
/// a whole level and `#` (if present) is the final level.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let levels: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        MULTI_LEVEL => i == last,
        SINGLE_LEVEL => true,
        other => !other.contains('+') && !other.contains('#'),
    })
}

/// A publish topic is valid when it is non-empty and has no wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains('+') && !topic.contains('#')
}
