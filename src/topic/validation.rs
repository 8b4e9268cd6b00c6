//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy an entire level and be the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are isolated from root-level wildcards

/// Validate a topic name (used in PUBLISH)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
///
/// Topic filters:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Multi-level wildcard (#) must be the entire last level
/// - Single-level wildcard (+) must occupy an entire level
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topic_names() {
        assert!(validate_topic_name("a").is_ok());
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("$SYS/broker/uptime").is_ok());
        assert!(validate_topic_name("/leading/empty").is_ok());
        assert!(validate_topic_name("trailing/empty/").is_ok());
    }

    #[test]
    fn test_invalid_topic_names() {
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_valid_topic_filters() {
        assert!(validate_topic_filter("a/b/c").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("$SYS/#").is_ok());
    }

    #[test]
    fn test_invalid_topic_filters() {
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("#/tail").is_err());
        assert!(validate_topic_filter("a+/b").is_err());
        assert!(validate_topic_filter("a/+b").is_err());
        assert!(validate_topic_filter("a\0b").is_err());
    }
}
