use serde::{Deserialize, Serialize};
use std::fmt;

// One element of a query key. Kept to hashable scalars so keys can index a map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        KeyPart::Str(s.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Int(n)
    }
}

impl From<u32> for KeyPart {
    fn from(n: u32) -> Self {
        KeyPart::Int(n as i64)
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(KeyPart::Null)
    }
}

/// Ordered tuple identifying a logical query.
///
/// Keys sharing a leading sequence of parts form a hierarchy: `["issues"]` is a
/// prefix of `["issues", "list", ...]` and of `["issues", "detail", id]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn new(root: impl Into<KeyPart>) -> Self {
        QueryKey(vec![root.into()])
    }

    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match part {
                KeyPart::Null => f.write_str("null")?,
                KeyPart::Bool(b) => write!(f, "{b}")?,
                KeyPart::Int(n) => write!(f, "{n}")?,
                KeyPart::Str(s) => write!(f, "\"{s}\"")?,
            }
        }
        f.write_str("]")
    }
}

// Key factories per resource family.

pub mod issues {
    use super::QueryKey;
    use crate::models::IssueFilter;

    pub fn all() -> QueryKey {
        QueryKey::new("issues")
    }

    pub fn lists() -> QueryKey {
        all().with("list")
    }

    pub fn list(filter: &IssueFilter) -> QueryKey {
        lists()
            .with(filter.status.map(|s| s.as_str()))
            .with(filter.category.as_deref())
            .with(filter.page)
            .with(filter.page_size)
    }

    pub fn details() -> QueryKey {
        all().with("detail")
    }

    pub fn detail(id: &str) -> QueryKey {
        details().with(id)
    }

    pub fn comments(issue_id: &str) -> QueryKey {
        detail(issue_id).with("comments")
    }

    pub fn stats() -> QueryKey {
        all().with("stats")
    }
}

pub mod notifications {
    use super::QueryKey;

    pub fn all() -> QueryKey {
        QueryKey::new("notifications")
    }

    pub fn for_user(user_id: &str) -> QueryKey {
        all().with(user_id)
    }

    pub fn list(user_id: &str) -> QueryKey {
        for_user(user_id).with("list")
    }

    pub fn unread_count(user_id: &str) -> QueryKey {
        for_user(user_id).with("unread")
    }
}

pub mod profiles {
    use super::QueryKey;

    pub fn all() -> QueryKey {
        QueryKey::new("profiles")
    }

    pub fn detail(user_id: &str) -> QueryKey {
        all().with(user_id)
    }
}
