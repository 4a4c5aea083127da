//! Test doubles shared by the engine and session tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::note_id::NoteId;
use crate::prompt::{ConflictChoice, Prompter};
use crate::remote::{Created, Fetched, RemoteError, RemoteNote, RemoteStore};

/// Failure mode the in-memory remote simulates on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Network,
    Auth,
}

/// In-memory [`RemoteStore`] with controllable failure modes, latency, and
/// call counters.
pub struct MemoryRemote {
    notes: Mutex<HashMap<NoteId, RemoteNote>>,
    available: AtomicBool,
    fail: Mutex<Option<FailMode>>,
    delay: Mutex<Option<Duration>>,
    pub fetch_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            notes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
            fetch_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, id: &NoteId, content: &str, encrypted: bool, updated_at: DateTime<Utc>) {
        self.notes.lock().unwrap().insert(
            id.clone(),
            RemoteNote {
                content: content.to_string(),
                encrypted,
                updated_at,
            },
        );
    }

    pub fn get(&self, id: &NoteId) -> Option<RemoteNote> {
        self.notes.lock().unwrap().get(id).cloned()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail(&self, mode: Option<FailMode>) {
        *self.fail.lock().unwrap() = mode;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn remote_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
            + self.create_calls.load(Ordering::SeqCst)
            + self.update_calls.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match *self.fail.lock().unwrap() {
            Some(FailMode::Network) => Err(RemoteError::Network("simulated outage".into())),
            Some(FailMode::Auth) => Err(RemoteError::Auth("simulated expired token".into())),
            None => Ok(()),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, id: &NoteId) -> Result<Fetched, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        match self.notes.lock().unwrap().get(id) {
            Some(note) => Ok(Fetched::Found(note.clone())),
            None => Ok(Fetched::NotFound),
        }
    }

    async fn create(
        &self,
        id: Option<&NoteId>,
        content: &str,
        encrypted: bool,
    ) -> Result<Created, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        let id = id.cloned().unwrap_or_else(NoteId::generate);
        let updated_at = Utc::now();
        self.insert(&id, content, encrypted, updated_at);
        Ok(Created { id, updated_at })
    }

    async fn update(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
    ) -> Result<DateTime<Utc>, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        // upsert: a missing id falls back to creation
        let updated_at = Utc::now();
        self.insert(id, content, encrypted, updated_at);
        Ok(updated_at)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// [`Prompter`] answering with a preset choice and password, counting calls.
pub struct ScriptedPrompter {
    pub password: Mutex<Option<String>>,
    pub choice: Mutex<ConflictChoice>,
    pub password_calls: AtomicUsize,
    pub conflict_calls: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(choice: ConflictChoice) -> Self {
        Self {
            password: Mutex::new(None),
            choice: Mutex::new(choice),
            password_calls: AtomicUsize::new(0),
            conflict_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_password(choice: ConflictChoice, password: &str) -> Self {
        let prompter = Self::new(choice);
        *prompter.password.lock().unwrap() = Some(password.to_string());
        prompter
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn prompt_password(&self) -> Option<String> {
        self.password_calls.fetch_add(1, Ordering::SeqCst);
        self.password.lock().unwrap().clone()
    }

    async fn prompt_conflict(&self, _local: &str, _remote: &str) -> ConflictChoice {
        self.conflict_calls.fetch_add(1, Ordering::SeqCst);
        *self.choice.lock().unwrap()
    }
}
