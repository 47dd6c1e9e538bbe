//! Identifier types for the placement model.
//!
//! Pods are keyed by their [`Uid`] everywhere inside the scheduler. Uids issued
//! by an API server are opaque strings; locally created objects use UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a pod (or any other object with identity).
///
/// The empty uid is representable so that malformed objects can be observed
/// and rejected by the cache with a descriptive error.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Wrap an existing uid string without validation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a new random uid.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Parse a uid, rejecting the empty string.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::Empty`] if `s` is empty.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(s.to_string()))
    }

    /// Parse a uid that must be a UUID.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidUuid`] if `s` is not a UUID.
    pub fn parse_uuid(s: &str) -> Result<Self, IdError> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid.to_string()))
    }

    /// Return the uid as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the uid is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Uid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Uid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uid> for String {
    fn from(id: Uid) -> Self {
        id.0
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier is empty.
    #[error("empty identifier")]
    Empty,

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uids_are_unique() {
        let a = Uid::generate();
        let b = Uid::generate();
        assert_ne!(a, b);
        assert!(Uid::parse_uuid(a.as_str()).is_ok());
    }

    #[test]
    fn empty_uid_rejected() {
        assert!(matches!(Uid::parse(""), Err(IdError::Empty)));
        assert!(matches!("".parse::<Uid>(), Err(IdError::Empty)));
        assert!(Uid::default().is_empty());
    }

    #[test]
    fn invalid_uuid_rejected() {
        assert!(matches!(
            Uid::parse_uuid("not-a-uuid"),
            Err(IdError::InvalidUuid)
        ));
    }

    #[test]
    fn uid_serializes_as_plain_string() {
        let id = Uid::new("pod-1234");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"pod-1234\"");
        let parsed: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(format!("{id:?}"), "Uid(pod-1234)");
    }
}
