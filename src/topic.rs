/// Does `topic` match the subscription `filter`?
///
/// `#` on its own matches everything. A `+` level matches exactly one non-empty topic
/// level and a trailing `/#` matches the preceding levels plus any remainder, including
/// none at all (`a/#` matches `a`). Everything else is compared literally and the whole
/// topic has to match. Never fails: empty or malformed input just doesn't match.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == "#" {
        return true;
    }
    if filter.is_empty() {
        return false;
    }

    let (body, multi_level) = match filter.strip_suffix("/#") {
        Some(body) => (body, true),
        None => (filter, false),
    };

    let mut topic_levels = topic.split('/');
    for level in body.split('/') {
        match topic_levels.next() {
            Some(candidate) if level == "+" => {
                if candidate.is_empty() {
                    return false;
                }
            }
            Some(candidate) if level == candidate => {}
            _ => return false,
        }
    }

    multi_level || topic_levels.next().is_none()
}

/// Whether `filter` is acceptable as a subscription filter.
///
/// Every level must either be a lone wildcard or free of wildcard characters, and `#`
/// may only appear as the final level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "+" => true,
        "#" => i == last,
        other => !other.contains(['+', '#']),
    })
}

/// Whether `topic` can be published to: non-empty and without wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/b/c"));
        assert!(!matches("a/+/c", "a//c"));
        assert!(matches("+", "a"));
        assert!(!matches("+", "a/b"));
        assert!(matches("+/+", "a/b"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/"));
        assert!(!matches("a/#", "ab"));
        assert!(!matches("a/#", "b/a"));
        assert!(matches("a/+/#", "a/b/c/d"));
    }

    #[test]
    fn hash_matches_everything() {
        for topic in ["", "a", "a/b/c", "/leading", "$SYS/broker"] {
            assert!(matches("#", topic), "{topic}");
        }
    }

    #[test]
    fn literal_and_anchored() {
        assert!(matches("sensors/room1/temp", "sensors/room1/temp"));
        assert!(!matches("sensors/room1", "sensors/room1/temp"));
        assert!(!matches("sensors/room1/temp", "sensors/room1"));
        assert!(!matches("Sensors/room1", "sensors/room1"));
        assert!(matches("a.b/(c)", "a.b/(c)"));
        assert!(!matches("a.b", "axb"));
    }

    #[test]
    fn wildcard_characters_inside_a_level_are_literal() {
        assert!(matches("a+/b", "a+/b"));
        assert!(!matches("a+/b", "ax/b"));
        assert!(matches("a/b#", "a/b#"));
        assert!(!matches("a/b#", "a/bc"));
    }

    #[test]
    fn empty_inputs() {
        assert!(!matches("", "a"));
        assert!(!matches("", ""));
        assert!(!matches("a", ""));
        assert!(matches("/#", ""));
        assert!(matches("/#", "/x"));
    }

    #[test]
    fn filter_validation() {
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/+/c"));
        assert!(is_valid_filter("a/#"));
        assert!(is_valid_filter("+/+/#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/c"));
        assert!(!is_valid_filter("a/b+"));
        assert!(!is_valid_filter("a#"));
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("a/b"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("a/+"));
        assert!(!is_valid_topic("a/#"));
    }
}
