//! Hierarchical resource names.

use std::fmt;

/// The path of a lockable resource, ordered root-first.
///
/// Two names are equal iff their full paths are. `database/users/3` is a
/// descendant of `database/users` and of `database`, never of itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    parts: Vec<String>,
}

impl ResourceName {
    /// A root-level name (the database).
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            parts: vec![name.into()],
        }
    }

    /// The name one level below `self`.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(segment.into());
        Self { parts }
    }

    /// Path segments, root first.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The enclosing name, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        (self.parts.len() > 1).then(|| Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    /// Whether `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        self.parts.len() > ancestor.parts.len()
            && self.parts[..ancestor.parts.len()] == ancestor.parts[..]
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join("/"))
    }
}
