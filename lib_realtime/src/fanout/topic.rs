//! # Topic Keys
//!
//! A `Topic` is an opaque, non-empty string scoping publish/subscribe traffic.
//! Two derivations exist:
//!
//! - `Topic::entity("post", "42")` -> `post:42`, a one-to-many stream.
//! - `Topic::pair(a, b)` -> `pair:<min>:<max>`, a two-party stream. Both
//!   participants derive the same key whatever the argument order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const PAIR_PREFIX: &str = "pair";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a persisted item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Broadcast scope key. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Wraps an already-derived key.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ValidationError::InvalidTopic("topic must not be empty".into()));
        }
        Ok(Self(key))
    }

    /// One-to-many stream for an entity, e.g. the comments of a post.
    pub fn entity(kind: &str, entity_id: &str) -> Result<Self, ValidationError> {
        if kind.is_empty() || entity_id.is_empty() {
            return Err(ValidationError::InvalidTopic(format!(
                "entity topic needs a kind and an id, got '{}:{}'",
                kind, entity_id
            )));
        }
        if kind == PAIR_PREFIX {
            return Err(ValidationError::InvalidTopic(
                "'pair' is reserved for two-party topics".into(),
            ));
        }
        Ok(Self(format!("{}:{}", kind, entity_id)))
    }

    /// Two-party stream. Order-independent.
    pub fn pair(a: &Identity, b: &Identity) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}:{}:{}", PAIR_PREFIX, lo, hi))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participants of a pair topic, `None` for entity topics.
    pub fn participants(&self) -> Option<(Identity, Identity)> {
        let rest = self.0.strip_prefix(PAIR_PREFIX)?.strip_prefix(':')?;
        let (a, b) = rest.split_once(':')?;
        Some((Identity::from(a), Identity::from(b)))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_topic_is_symmetric() {
        let pairs = [("u1", "u2"), ("zeta", "alpha"), ("same", "same"), ("", "x")];
        for (a, b) in pairs {
            let (a, b) = (Identity::from(a), Identity::from(b));
            assert_eq!(Topic::pair(&a, &b), Topic::pair(&b, &a));
        }
        assert_eq!(
            Topic::pair(&Identity::from("u2"), &Identity::from("u1")).as_str(),
            "pair:u1:u2"
        );
    }

    #[test]
    fn entity_topic_format() {
        assert_eq!(Topic::entity("post", "42").unwrap().as_str(), "post:42");
        assert!(Topic::entity("post", "").is_err());
        assert!(Topic::entity("pair", "42").is_err());
    }

    #[test]
    fn participants_round_out_of_pair_key() {
        let t = Topic::pair(&Identity::from("b"), &Identity::from("a"));
        assert_eq!(t.participants(), Some((Identity::from("a"), Identity::from("b"))));
        assert_eq!(Topic::entity("post", "1").unwrap().participants(), None);
    }

    #[test]
    fn empty_topic_rejected_on_deserialize() {
        assert!(serde_json::from_str::<Topic>("\"\"").is_err());
        let t: Topic = serde_json::from_str("\"post:9\"").unwrap();
        assert_eq!(t.as_str(), "post:9");
    }
}
