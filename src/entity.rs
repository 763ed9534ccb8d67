use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of an authenticated user.
///
/// Identities are compared and ordered as plain strings; room participants are
/// stored with the lexicographically smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds a user id from untrusted input, rejecting blank values.
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Returns the pair in canonical order (smaller identity first).
pub fn canonical_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_ids() {
        assert!(UserId::parse("").is_none());
        assert!(UserId::parse("   ").is_none());
        assert_eq!(UserId::parse(" alice ").unwrap().as_str(), "alice");
    }

    #[test]
    fn canonical_pair_is_order_independent() {
        let ab = canonical_pair("bob".into(), "alice".into());
        let ba = canonical_pair("alice".into(), "bob".into());
        assert_eq!(ab, ba);
        assert_eq!(ab.0.as_str(), "alice");
    }
}
