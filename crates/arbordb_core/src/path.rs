//! Hierarchical path keys.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Characters that may not appear in user-supplied keys.
const RESERVED_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// Maximum nesting depth accepted from user-supplied path strings.
const MAX_PATH_DEPTH: usize = 32;

/// An immutable hierarchical key: an ordered sequence of string components.
///
/// Paths compare component-wise and render slash-joined with a leading
/// slash (`/a/b/c`). The empty path addresses the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    pieces: Vec<String>,
}

impl Path {
    /// Returns the empty path addressing the root.
    #[must_use]
    pub fn root() -> Self {
        Self { pieces: Vec::new() }
    }

    /// Parses a path from a slash-separated string.
    ///
    /// Empty components (leading, trailing or doubled slashes) are
    /// discarded, so `"/a//b/"` parses the same as `"a/b"`.
    #[must_use]
    pub fn new(path: &str) -> Self {
        let pieces = path
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();
        Self { pieces }
    }

    /// Parses a user-supplied path, rejecting reserved characters in
    /// keys and excessive nesting.
    ///
    /// Internal keys such as `.info` are composed through [`Path::child`]
    /// and are not subject to these checks.
    pub fn try_new(path: &str) -> CoreResult<Self> {
        let parsed = Self::new(path);
        if parsed.len() > MAX_PATH_DEPTH {
            return Err(CoreError::InvalidPath {
                message: format!(
                    "{} levels deep, maximum is {MAX_PATH_DEPTH}",
                    parsed.len()
                ),
            });
        }
        for piece in &parsed.pieces {
            if piece.contains(RESERVED_KEY_CHARS) {
                return Err(CoreError::InvalidKey { key: piece.clone() });
            }
        }
        Ok(parsed)
    }

    /// Builds a path from pre-split components.
    #[must_use]
    pub fn from_pieces(pieces: Vec<String>) -> Self {
        Self { pieces }
    }

    /// Returns true if this is the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Returns the number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Returns the first component, if any.
    #[must_use]
    pub fn front(&self) -> Option<&str> {
        self.pieces.first().map(String::as_str)
    }

    /// Returns the path with the first component removed.
    ///
    /// Popping the root path yields the root path.
    #[must_use]
    pub fn pop_front(&self) -> Path {
        Self {
            pieces: self.pieces.iter().skip(1).cloned().collect(),
        }
    }

    /// Returns this path extended by a child key.
    ///
    /// The key may itself contain slashes (`child("a/b")` appends two
    /// components).
    #[must_use]
    pub fn child(&self, key: &str) -> Path {
        let mut pieces = self.pieces.clone();
        pieces.extend(key.split('/').filter(|p| !p.is_empty()).map(str::to_owned));
        Self { pieces }
    }

    /// Returns the parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Path> {
        if self.pieces.is_empty() {
            None
        } else {
            Some(Self {
                pieces: self.pieces[..self.pieces.len() - 1].to_vec(),
            })
        }
    }

    /// Returns the raw components.
    #[must_use]
    pub fn pieces(&self) -> &[String] {
        &self.pieces
    }

    /// Returns true if `self` is a prefix of `other` (or equal to it).
    #[must_use]
    pub fn contains(&self, other: &Path) -> bool {
        other.pieces.len() >= self.pieces.len()
            && self.pieces.iter().zip(&other.pieces).all(|(a, b)| a == b)
    }

    /// Returns true if one of the two paths is a prefix of the other.
    #[must_use]
    pub fn related_to(&self, other: &Path) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Returns the suffix of `descendant` relative to `self`.
    ///
    /// `self` must contain `descendant`; otherwise the full descendant
    /// path is returned unchanged.
    #[must_use]
    pub fn relative(&self, descendant: &Path) -> Path {
        if self.contains(descendant) {
            Self {
                pieces: descendant.pieces[self.pieces.len()..].to_vec(),
            }
        } else {
            descendant.clone()
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pieces.is_empty() {
            write!(f, "/")
        } else {
            for piece in &self.pieces {
                write!(f, "/{piece}")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_normalizes_slashes() {
        assert_eq!(Path::new("/a//b/"), Path::new("a/b"));
        assert_eq!(Path::new("").len(), 0);
        assert!(Path::new("/").is_empty());
    }

    #[test]
    fn front_and_pop() {
        let p = Path::new("a/b/c");
        assert_eq!(p.front(), Some("a"));
        assert_eq!(p.pop_front(), Path::new("b/c"));
        assert_eq!(Path::root().pop_front(), Path::root());
    }

    #[test]
    fn child_splits_keys() {
        let p = Path::new("a").child("b/c");
        assert_eq!(p, Path::new("a/b/c"));
    }

    #[test]
    fn display_has_leading_slash() {
        assert_eq!(Path::new("a/b").to_string(), "/a/b");
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn contains_is_prefix_test() {
        let a = Path::new("a");
        let ab = Path::new("a/b");
        assert!(a.contains(&ab));
        assert!(a.contains(&a));
        assert!(!ab.contains(&a));
        assert!(ab.related_to(&a));
        assert!(!Path::new("x").related_to(&ab));
    }

    #[test]
    fn relative_strips_prefix() {
        let a = Path::new("a");
        let abc = Path::new("a/b/c");
        assert_eq!(a.relative(&abc), Path::new("b/c"));
        assert_eq!(abc.relative(&abc), Path::root());
    }

    #[test]
    fn try_new_rejects_reserved_chars() {
        assert!(Path::try_new("users/alice").is_ok());
        assert!(Path::try_new("users/a.b").is_err());
        assert!(Path::try_new("users/a#b").is_err());
        assert!(Path::try_new("users/a$b").is_err());
    }

    #[test]
    fn try_new_rejects_excessive_depth() {
        let deep = vec!["k"; 33].join("/");
        assert!(Path::try_new(&deep).is_err());
        let ok = vec!["k"; 32].join("/");
        assert!(Path::try_new(&ok).is_ok());
    }

    #[test]
    fn ordering_is_component_wise() {
        assert!(Path::new("a") < Path::new("a/b"));
        assert!(Path::new("a/b") < Path::new("b"));
    }

    proptest! {
        #[test]
        fn parse_display_roundtrip(pieces in proptest::collection::vec("[a-z][a-z0-9_]{0,8}", 0..6)) {
            let path = Path::from_pieces(pieces.clone());
            prop_assert_eq!(Path::new(&path.to_string()), path);
        }

        #[test]
        fn child_then_relative_is_identity(
            base in proptest::collection::vec("[a-z]{1,4}", 0..4),
            key in "[a-z]{1,4}",
        ) {
            let base = Path::from_pieces(base);
            let extended = base.child(&key);
            prop_assert!(base.contains(&extended));
            prop_assert_eq!(base.relative(&extended), Path::new(&key));
        }
    }
}
