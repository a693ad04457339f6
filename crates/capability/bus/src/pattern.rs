//! 主题通配符匹配。

/// 判断到达主题是否命中订阅模式。
///
/// 按 `/` 切分后逐段比较：`+` 匹配任意单段；以 `#` 结尾的模式
/// 匹配所有共享其前缀的主题；否则要求段数完全一致。
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let mut pattern_parts: Vec<&str> = pattern.split('/').collect();

    let multilevel = pattern_parts.last() == Some(&"#");
    if multilevel {
        pattern_parts.pop();
        if topic_parts.len() < pattern_parts.len() {
            return false;
        }
    } else if topic_parts.len() != pattern_parts.len() {
        return false;
    }

    pattern_parts
        .iter()
        .zip(topic_parts.iter())
        .all(|(pattern_part, topic_part)| *pattern_part == "+" || pattern_part == topic_part)
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn single_level_wildcard_matches_exactly_one_segment() {
        assert!(topic_matches(
            "homeassistant/sensor/apc_ups/battery_charge/state",
            "homeassistant/sensor/apc_ups/+/state"
        ));
        assert!(!topic_matches(
            "homeassistant/sensor/apc_ups/battery_charge/extra/state",
            "homeassistant/sensor/apc_ups/+/state"
        ));
    }

    #[test]
    fn multilevel_wildcard_matches_any_suffix() {
        assert!(topic_matches("root/sensor/a/state", "root/sensor/#"));
        assert!(topic_matches("root/sensor/a/b/c", "root/sensor/#"));
        // 前缀本身也命中（少一段）
        assert!(topic_matches("root/sensor", "root/sensor/#"));
        assert!(!topic_matches("root/other/a", "root/sensor/#"));
    }

    #[test]
    fn segment_count_mismatch_never_matches() {
        assert!(!topic_matches("root/sensor/a", "root/sensor"));
        assert!(!topic_matches("root/sensor", "root/sensor/a"));
    }

    #[test]
    fn exact_pattern_requires_exact_segments() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/x", "a/b/c"));
        assert!(topic_matches("a/b/c", "a/+/c"));
    }
}
