//! Note identifier handling.
//!
//! Generated identifiers are UUIDs encoded with bs58check (base58 with a
//! checksum), which keeps them short and URL-safe. Identifiers supplied from
//! outside (a shared link, a CLI argument) are accepted verbatim as long as
//! they stay within the URL-safe alphabet.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing a note identifier.
#[derive(Error, Debug)]
pub enum NoteIdError {
    #[error("note id is empty")]
    Empty,

    #[error("note id contains non URL-safe character {0:?}")]
    InvalidCharacter(char),
}

/// An opaque, URL-safe note identifier.
///
/// Immutable for the lifetime of a note; two notes never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NoteId(String);

impl NoteId {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(bs58::encode(uuid.as_bytes()).with_check().into_string())
    }

    /// Accept an externally supplied identifier.
    ///
    /// Only the URL-safe alphabet (`A-Z a-z 0-9 - _`) is allowed, so an
    /// identifier can always travel in a query parameter unescaped.
    pub fn parse(s: &str) -> Result<Self, NoteIdError> {
        if s.is_empty() {
            return Err(NoteIdError::Empty);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
        {
            return Err(NoteIdError::InvalidCharacter(c));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NoteId {
    type Err = NoteIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NoteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = NoteId::generate();
        let b = NoteId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generated_ids_are_url_safe() {
        let id = NoteId::generate();
        assert!(NoteId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_parse_accepts_url_safe() {
        let id = NoteId::parse("my-note_123").unwrap();
        assert_eq!(id.as_str(), "my-note_123");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(NoteId::parse(""), Err(NoteIdError::Empty)));
    }

    #[test]
    fn test_parse_rejects_unsafe_characters() {
        for bad in ["a/b", "a b", "a?b", "héllo"] {
            assert!(
                matches!(NoteId::parse(bad), Err(NoteIdError::InvalidCharacter(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_display_matches_as_str() {
        let id = NoteId::generate();
        assert_eq!(format!("{}", id), id.as_str());
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = NoteId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: NoteId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_deserialize_rejects_invalid() {
        let result: Result<NoteId, _> = serde_json::from_str("\"has space\"");
        assert!(result.is_err());
    }
}
