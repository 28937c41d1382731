//! Dot-delimited path handling.
//!
//! A vBus path is a sequence of non-empty, whitespace-free segments joined by
//! `.`. The same syntax is used for bus subjects, so every helper here is
//! segment-aware: `a.b` is an ancestor of `a.b.c` but not of `a.bc`.

use crate::error::{VbusError, VbusResult};

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Reserved segment rewritten to the resolving process's hostname.
pub const LOCAL_SEGMENT: &str = "local";

/// Quick test on whether a subject is acceptable.
///
/// Whitespace is not allowed and every token must be non-empty.
pub fn bad_subject(subject: &str) -> bool {
    if subject.contains([' ', '\t', '\r', '\n']) {
        return true;
    }
    subject.split(SEPARATOR).any(str::is_empty)
}

/// Validate a path, returning it unchanged when well-formed.
pub fn validate(path: &str) -> VbusResult<&str> {
    if bad_subject(path) {
        return Err(VbusError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

/// Validate a relative path where the empty string designates the root.
pub fn validate_relative(path: &str) -> VbusResult<&str> {
    if path.is_empty() {
        return Ok(path);
    }
    validate(path)
}

/// Iterate the segments of a path. The empty path has no segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Join two paths, treating an empty side as the root.
pub fn join(base: &str, sub: &str) -> String {
    match (base.is_empty(), sub.is_empty()) {
        (true, _) => sub.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}{SEPARATOR}{sub}"),
    }
}

/// Split a path into its parent and its last segment.
///
/// A single-segment path has the empty (root) parent.
pub fn split_last(path: &str) -> (&str, &str) {
    match path.rfind(SEPARATOR) {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// True when `prefix` equals `path` or is one of its ancestors.
pub fn is_ancestor_or_self(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Strip `base` from the front of `subject`.
///
/// Returns the remainder below `base` (empty when they are equal), or `None`
/// when `subject` is not `base` or one of its descendants.
pub fn strip_base<'a>(subject: &'a str, base: &str) -> Option<&'a str> {
    if base.is_empty() {
        return Some(subject);
    }
    match subject.strip_prefix(base) {
        Some("") => Some(""),
        Some(rest) => rest.strip_prefix(SEPARATOR),
        None => None,
    }
}

/// Replace the first interior `local` segment with `hostname`.
///
/// `system.foobar.local.config` becomes `system.foobar.<hostname>.config`.
pub fn sanitize_local(path: &str, hostname: &str) -> String {
    let parts: Vec<&str> = path.split(SEPARATOR).collect();
    if parts.len() < 3 {
        return path.to_string();
    }
    let last = parts.len() - 1;
    let mut replaced = false;
    parts
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            if !replaced && i > 0 && i < last && *segment == LOCAL_SEGMENT {
                replaced = true;
                hostname
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_subject_rejects_empty_and_whitespace() {
        assert!(bad_subject("a..b"));
        assert!(bad_subject("a b.c"));
        assert!(bad_subject("a.b\t"));
        assert!(bad_subject(".a"));
        assert!(bad_subject("a."));
        assert!(bad_subject(""));
    }

    #[test]
    fn test_bad_subject_accepts_well_formed() {
        assert!(!bad_subject("system.zigbee.device1"));
        assert!(!bad_subject("system"));
        assert!(!bad_subject("system.zigbee.>"));
        assert!(!bad_subject("system.*.config"));
    }

    #[test]
    fn test_validate_relative_allows_root() {
        assert!(validate_relative("").is_ok());
        assert!(validate_relative("a.b").is_ok());
        assert!(matches!(
            validate_relative("a..b"),
            Err(VbusError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_join_and_split() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a.b", "c"), "a.b.c");
        assert_eq!(split_last("a.b.c"), ("a.b", "c"));
        assert_eq!(split_last("c"), ("", "c"));
    }

    #[test]
    fn test_ancestor_is_segment_aware() {
        assert!(is_ancestor_or_self("system.zigbee", "system.zigbee.h1"));
        assert!(is_ancestor_or_self("system.zigbee.h1", "system.zigbee.h1"));
        assert!(!is_ancestor_or_self("system.zig", "system.zigbee.h1"));
        assert!(!is_ancestor_or_self("system.zigbee.h1.x", "system.zigbee.h1"));
    }

    #[test]
    fn test_strip_base() {
        assert_eq!(strip_base("a.b.c.get", "a.b"), Some("c.get"));
        assert_eq!(strip_base("a.b", "a.b"), Some(""));
        assert_eq!(strip_base("a.bc.get", "a.b"), None);
        assert_eq!(strip_base("x.y", "a.b"), None);
    }

    #[test]
    fn test_sanitize_local() {
        assert_eq!(
            sanitize_local("system.foobar.local.config.ip", "hub1"),
            "system.foobar.hub1.config.ip"
        );
        // Leading/trailing `local` is not the reserved interior segment.
        assert_eq!(sanitize_local("local.a.b", "hub1"), "local.a.b");
        assert_eq!(sanitize_local("a.b.local", "hub1"), "a.b.local");
        // Only the first occurrence is rewritten.
        assert_eq!(sanitize_local("a.local.local.b", "h"), "a.h.local.b");
    }
}
