//! Command suffixes appended to tree paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A command suffix: `<path>.add`, `<path>.get`, `<path>.set`, `<path>.remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Add,
    Get,
    Set,
    Remove,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "add",
            Command::Get => "get",
            Command::Set => "set",
            Command::Remove => "remove",
        }
    }

    /// Recognise a single path segment as a command.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "add" => Some(Command::Add),
            "get" => Some(Command::Get),
            "set" => Some(Command::Set),
            "remove" => Some(Command::Remove),
            _ => None,
        }
    }

    /// Split a trailing command suffix off a path.
    ///
    /// `a.b.get` yields `("a.b", Some(Get))`, a bare `get` yields
    /// `("", Some(Get))` and `a.b` yields `("a.b", None)`.
    pub fn split(tail: &str) -> (&str, Option<Command>) {
        let (parent, last) = crate::path::split_last(tail);
        match Command::from_segment(last) {
            Some(cmd) => (parent, Some(cmd)),
            None => (tail, None),
        }
    }

    /// Append this command to `path`.
    pub fn subject(&self, path: &str) -> String {
        crate::path::join(path, self.as_str())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_recognised_suffix() {
        assert_eq!(Command::split("a.b.get"), ("a.b", Some(Command::Get)));
        assert_eq!(Command::split("a.remove"), ("a", Some(Command::Remove)));
        assert_eq!(Command::split("set"), ("", Some(Command::Set)));
    }

    #[test]
    fn test_split_without_suffix() {
        assert_eq!(Command::split("a.b.getter"), ("a.b.getter", None));
        assert_eq!(Command::split(""), ("", None));
    }

    #[test]
    fn test_subject() {
        assert_eq!(Command::Add.subject("x.y"), "x.y.add");
        assert_eq!(Command::Get.subject(""), "get");
    }
}
