//! Hierarchical cache keys.
//!
//! Keys are tuples such as `(media, download, channel, message, thumb)`.
//! Prefix matching on whole parts drives invalidation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One component of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<usize> for KeyPart {
    fn from(v: usize) -> Self {
        KeyPart::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Text(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Text(v)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{v}"),
            KeyPart::Text(v) => f.write_str(v),
        }
    }
}

/// A structured, hashable cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Start a key in the given domain.
    pub fn new(domain: impl Into<KeyPart>) -> Self {
        Self(vec![domain.into()])
    }

    /// Append a part, builder style.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// The first part, if it is text.
    pub fn domain(&self) -> Option<&str> {
        match self.0.first() {
            Some(KeyPart::Text(d)) => Some(d),
            _ => None,
        }
    }

    /// Whether every part of `prefix` matches the leading parts of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Build a [`QueryKey`] from a list of parts.
///
/// ```
/// use feedline_cache::query_key;
/// let key = query_key!["comments", "thread", 1_i64, 2_i64];
/// assert_eq!(key.to_string(), "comments/thread/1/2");
/// ```
#[macro_export]
macro_rules! query_key {
    [$first:expr $(, $rest:expr)* $(,)?] => {
        $crate::QueryKey::new($first)$(.with($rest))*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matches_whole_parts() {
        let key = query_key!["comments", "thread", 10_i64, 20_i64];
        assert!(key.starts_with(&query_key!["comments"]));
        assert!(key.starts_with(&query_key!["comments", "thread", 10_i64]));
        assert!(!key.starts_with(&query_key!["comments", "thread", 1_i64]));
        assert!(!key.starts_with(&query_key!["comm"]));
    }

    #[test]
    fn test_display_and_domain() {
        let key = query_key!["media", "download", -100_i64, 5_i64, "thumb"];
        assert_eq!(key.to_string(), "media/download/-100/5/thumb");
        assert_eq!(key.domain(), Some("media"));
    }

    #[test]
    fn test_serializes_as_flat_array() {
        let key = query_key!["timeline", 3_usize];
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["timeline",3]"#);
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
