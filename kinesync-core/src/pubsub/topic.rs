use crate::error::{Result, SyncError};

/// Longest topic or subscription pattern accepted, in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// Trailing multi-level wildcard segment.
pub const WILDCARD: &str = "#";

/// Check a concrete topic used for publishing.
pub fn validate_topic(topic: &str) -> Result<()> {
    check_length(topic)?;
    if topic.contains(WILDCARD) {
        return Err(SyncError::InvalidTopic(format!(
            "wildcards are not allowed when publishing: {topic}"
        )));
    }
    Ok(())
}

/// Check a subscription pattern; `#` may only be the final whole segment.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    check_length(pattern)?;
    let mut segments = pattern.split('/').peekable();
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        if segment.contains(WILDCARD) && !(last && segment == WILDCARD) {
            return Err(SyncError::InvalidTopic(format!(
                "`#` must be the final segment: {pattern}"
            )));
        }
    }
    Ok(())
}

fn check_length(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(SyncError::InvalidTopic("topic is empty".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(SyncError::InvalidTopic(format!(
            "topic is {} bytes, limit is {MAX_TOPIC_LEN}",
            topic.len()
        )));
    }
    Ok(())
}

/// Whether a published `topic` is delivered to subscribers of `pattern`.
///
/// `a/b/#` matches `a/b` itself and anything below it, but not `a/bc`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    match pattern.strip_suffix("/#") {
        Some(prefix) => {
            topic == prefix
                || topic
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        }
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_covers_prefix_and_descendants_only() {
        assert!(topic_matches("test/#", "test"));
        assert!(topic_matches("test/#", "test/hello"));
        assert!(topic_matches("test/#", "test/a/b/c"));
        assert!(!topic_matches("test/#", "test2"));
        assert!(!topic_matches("test/#", "tes"));
        assert!(!topic_matches("test/#", "other/test"));
    }

    #[test]
    fn plain_patterns_are_exact() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b", "a"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn length_limit_applies_to_topics_and_patterns() {
        let long = "x".repeat(MAX_TOPIC_LEN + 1);
        assert!(validate_topic(&long).is_err());
        assert!(validate_pattern(&long).is_err());

        let exact = "x".repeat(MAX_TOPIC_LEN);
        assert!(validate_topic(&exact).is_ok());
    }

    #[test]
    fn wildcard_placement_is_checked() {
        assert!(validate_pattern("a/#").is_ok());
        assert!(validate_pattern("#").is_ok());
        assert!(validate_pattern("a/#/b").is_err());
        assert!(validate_pattern("a/b#").is_err());
        assert!(validate_topic("a/#").is_err());
        assert!(validate_topic("").is_err());
    }
}
