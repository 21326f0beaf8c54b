//! Normalized, slash-separated remote paths.
//!
//! Remote paths are always absolute, never end with a slash (except the root
//! itself) and never contain empty, `.` or `..` components.

use core::fmt;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct RemotePath(String);

impl RemotePath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalize a path. Duplicate and trailing slashes are removed.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let mut parts = Vec::new();
        for part in raw.split('/') {
            match part {
                "" => continue,
                "." | ".." => {
                    return Err(CoreError::InvalidPath {
                        path: raw.to_string(),
                        reason: "relative components are not allowed",
                    });
                }
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", parts.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Append a single child name.
    pub fn join(&self, name: &str) -> CoreResult<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(CoreError::InvalidPath {
                path: name.to_string(),
                reason: "child name must be a single component",
            });
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last component; empty for the root.
    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|p| !p.is_empty())
    }

    pub fn starts_with(&self, ancestor: &RemotePath) -> bool {
        ancestor.is_root()
            || self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0[ancestor.0.len()..].starts_with('/'))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RemotePath {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RemotePath> for String {
    fn from(value: RemotePath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_normalizes_slashes() {
        let p = RemotePath::parse("//home/user//cases/").unwrap();
        assert_eq!(p.as_str(), "/home/user/cases");
        assert_eq!(RemotePath::parse("").unwrap(), RemotePath::root());
    }

    #[test]
    fn parse_rejects_dot_components() {
        assert!(RemotePath::parse("/a/../b").is_err());
        assert!(RemotePath::parse("./a").is_err());
    }

    #[test]
    fn parent_and_name() {
        let p = RemotePath::parse("/a/b/c").unwrap();
        assert_eq!(p.file_name(), "c");
        assert_eq!(p.parent().unwrap().as_str(), "/a/b");
        assert_eq!(RemotePath::parse("/a").unwrap().parent(), Some(RemotePath::root()));
        assert_eq!(RemotePath::root().parent(), None);
    }

    #[test]
    fn join_rejects_nested_names() {
        let root = RemotePath::root();
        assert_eq!(root.join("x").unwrap().as_str(), "/x");
        assert!(root.join("x/y").is_err());
        assert!(root.join("").is_err());
    }

    #[test]
    fn starts_with_respects_component_boundaries() {
        let a = RemotePath::parse("/cases/run1").unwrap();
        let b = RemotePath::parse("/cases/run10").unwrap();
        let parent = RemotePath::parse("/cases").unwrap();
        assert!(a.starts_with(&parent));
        assert!(!b.starts_with(&a));
        assert!(a.starts_with(&RemotePath::root()));
    }

    proptest! {
        #[test]
        fn join_then_parent_is_identity(names in proptest::collection::vec("[a-zA-Z0-9_]{1,8}", 0..5), leaf in "[a-z]{1,6}") {
            let mut p = RemotePath::root();
            for n in &names {
                p = p.join(n).unwrap();
            }
            let child = p.join(&leaf).unwrap();
            prop_assert_eq!(child.parent().unwrap(), p);
            prop_assert_eq!(child.file_name(), leaf.as_str());
        }
    }
}
