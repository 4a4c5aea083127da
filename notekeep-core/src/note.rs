//! The note model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::note_id::NoteId;

/// Where a note's current state came from, relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Never synchronized; exists only in the local cache.
    #[serde(rename = "local-only")]
    LocalOnly,
    /// Content is byte-identical to the last fetched remote copy.
    #[serde(rename = "synced-from-remote")]
    SyncedFromRemote,
    /// Edited locally since the last sync with the remote store.
    #[serde(rename = "locally-modified-after-sync")]
    LocallyModified,
}

/// A note: identifier, content, and sync metadata.
///
/// `content` holds plaintext, or a ciphertext envelope when `encrypted` is
/// set. `updated_at` advances strictly on every persisted mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: NoteId,
    pub content: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl Note {
    /// Creates a new empty note under the given identifier.
    pub fn new(id: NoteId) -> Self {
        let now = Utc::now();
        Self {
            id,
            content: String::new(),
            encrypted: false,
            created_at: now,
            updated_at: now,
            provenance: Provenance::LocalOnly,
        }
    }
}

/// A timestamp strictly after `after`, preferring the current time.
///
/// Keeps `updated_at` strictly increasing even when the clock has not
/// advanced past the previous save.
pub(crate) fn advance_past(after: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > after {
        now
    } else {
        after + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_note_is_empty_and_local_only() {
        let id = NoteId::generate();
        let note = Note::new(id.clone());
        assert_eq!(note.id, id);
        assert!(note.content.is_empty());
        assert!(!note.encrypted);
        assert_eq!(note.provenance, Provenance::LocalOnly);
        assert_eq!(note.created_at, note.updated_at);
    }

    #[test]
    fn test_advance_past_is_strictly_increasing() {
        let mut ts = Utc::now();
        for _ in 0..100 {
            let next = advance_past(ts);
            assert!(next > ts);
            ts = next;
        }
    }

    #[test]
    fn test_advance_past_future_timestamp() {
        let future = Utc::now() + Duration::hours(1);
        assert!(advance_past(future) > future);
    }

    #[test]
    fn test_provenance_serializes_with_legacy_names() {
        let json = serde_json::to_string(&Provenance::LocallyModified).unwrap();
        assert_eq!(json, "\"locally-modified-after-sync\"");
        let back: Provenance = serde_json::from_str("\"synced-from-remote\"").unwrap();
        assert_eq!(back, Provenance::SyncedFromRemote);
    }

    #[test]
    fn test_note_serde_roundtrip() {
        let note = Note::new(NoteId::generate());
        let json = serde_json::to_string(&note).unwrap();
        let back: Note = serde_json::from_str(&json).unwrap();
        assert_eq!(note, back);
    }
}
