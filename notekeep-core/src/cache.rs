//! Durable local note cache.
//!
//! One JSON file per note under a data directory. Writes overwrite
//! unconditionally; conflict resolution happens in the sync engine, not
//! here. The cache is the guaranteed fallback when the remote store is
//! unreachable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::note::Note;
use crate::note_id::NoteId;

/// Errors that can occur reading or writing the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The underlying storage is full. Distinct so callers can report it;
    /// every other write failure is an ordinary I/O error.
    #[error("local storage exhausted writing {0}")]
    QuotaExhausted(PathBuf),

    #[error("I/O error for {0}: {1}")]
    Io(PathBuf, #[source] io::Error),

    #[error("corrupt cache entry {0}: {1}")]
    Corrupt(PathBuf, #[source] serde_json::Error),
}

/// File-backed note cache.
#[derive(Clone)]
pub struct LocalCache {
    data_dir: PathBuf,
}

impl LocalCache {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Current filename scheme. All writes use this.
    fn path(&self, id: &NoteId) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    /// Filename scheme of earlier releases. Read-only fallback; no
    /// migration is performed.
    fn legacy_path(&self, id: &NoteId) -> PathBuf {
        self.data_dir.join(format!("note-{}.json", id))
    }

    /// Looks up a note, falling back to the legacy filename when the
    /// primary key misses.
    pub fn get(&self, id: &NoteId) -> Result<Option<Note>, CacheError> {
        match self.read_file(&self.path(id))? {
            Some(note) => Ok(Some(note)),
            None => self.read_file(&self.legacy_path(id)),
        }
    }

    /// Writes a note unconditionally under the current filename scheme.
    pub fn put(&self, note: &Note) -> Result<(), CacheError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| self.classify_write_error(self.data_dir.clone(), e))?;

        let path = self.path(&note.id);
        let bytes =
            serde_json::to_vec_pretty(note).map_err(|e| CacheError::Corrupt(path.clone(), e))?;
        fs::write(&path, bytes).map_err(|e| self.classify_write_error(path, e))?;
        Ok(())
    }

    pub fn exists(&self, id: &NoteId) -> bool {
        self.path(id).exists() || self.legacy_path(id).exists()
    }

    fn read_file(&self, path: &Path) -> Result<Option<Note>, CacheError> {
        match fs::read(path) {
            Ok(bytes) => {
                let note = serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Corrupt(path.to_path_buf(), e))?;
                Ok(Some(note))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(path.to_path_buf(), e)),
        }
    }

    fn classify_write_error(&self, path: PathBuf, e: io::Error) -> CacheError {
        // ENOSPC / EDQUOT surface as quota exhaustion
        let quota = e.kind() == io::ErrorKind::StorageFull
            || matches!(e.raw_os_error(), Some(28) | Some(122));
        if quota {
            CacheError::QuotaExhausted(path)
        } else {
            CacheError::Io(path, e)
        }
    }
}
