//! Subject matching.
//!
//! Patterns use the usual pub/sub wildcards: `*` matches exactly one token,
//! `>` matches one or more trailing tokens and must be last.

use vbus_types::path::{bad_subject, SEPARATOR};

/// Whether `subject` is matched by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split(SEPARATOR);
    let mut sub = subject.split(SEPARATOR);
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A subject one can publish on: well-formed and free of wildcards.
pub fn is_valid_publish_subject(subject: &str) -> bool {
    !bad_subject(subject) && !subject.split(SEPARATOR).any(|t| t == "*" || t == ">")
}

/// A subscription pattern: well-formed, `>` only as the last token.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if bad_subject(pattern) {
        return false;
    }
    let tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
    let last = tokens.len() - 1;
    tokens
        .iter()
        .enumerate()
        .all(|(i, t)| *t != ">" || i == last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_full_wildcard_needs_one_token() {
        assert!(subject_matches("a.>", "a.b"));
        assert!(subject_matches("a.>", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(subject_matches(">", "anything.at.all"));
    }

    #[test]
    fn test_token_wildcard() {
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.x.c"));
        assert!(!subject_matches("a.*", "a"));
    }

    #[test]
    fn test_validation() {
        assert!(is_valid_publish_subject("system.zigbee.get"));
        assert!(!is_valid_publish_subject("system.>"));
        assert!(!is_valid_publish_subject("a..b"));
        assert!(is_valid_pattern("a.*.>"));
        assert!(!is_valid_pattern("a.>.b"));
        assert!(!is_valid_pattern(""));
    }
}
