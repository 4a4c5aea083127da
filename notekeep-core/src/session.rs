//! The in-memory session around the currently open note.
//!
//! Owns the edit buffer, the session password (never persisted), and the
//! autosave timers. Edits are buffered and flushed once input quiesces for
//! the debounce period; a periodic interval timer flushes regardless of
//! quiescence as a safety net. Both funnel into [`NoteSession::flush`],
//! which is idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::crypto;
use crate::note::Note;
use crate::note_id::NoteId;
use crate::sync::{SaveError, SyncContext, SyncEngine};

/// Quiet period after the last edit before the debounced flush fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);
/// Hard autosave interval, independent of quiescence.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

const PASSWORD_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no note is open in this session")]
    NoOpenNote,

    /// The operation resolved after a newer `open` superseded it; its result
    /// was discarded so a slow load cannot clobber the newer note.
    #[error("superseded by a newer open")]
    Superseded,

    #[error("note content could not be decrypted")]
    DecryptionFailed,

    #[error(transparent)]
    Save(#[from] SaveError),
}

struct OpenNote {
    id: NoteId,
    encrypted: bool,
    /// Plaintext being edited.
    buffer: String,
    /// Plaintext last successfully flushed; `None` forces the next flush.
    last_saved: Option<String>,
    /// Plaintext at open time, for refresh no-op detection.
    opened_snapshot: String,
}

/// Mediates between user input and the sync engine for one open note.
///
/// Cheap to clone; clones share the same session state.
#[derive(Clone)]
pub struct NoteSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    engine: Arc<SyncEngine>,
    state: Mutex<Option<OpenNote>>,
    password: Mutex<Option<String>>,
    /// Bumped on every `open`; in-flight work from older generations is
    /// abandoned when it resolves late.
    generation: AtomicU64,
    edit_seq: AtomicU64,
    debounce: Duration,
    interval: Duration,
}

impl NoteSession {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self::with_timers(engine, DEFAULT_DEBOUNCE, DEFAULT_AUTOSAVE_INTERVAL)
    }

    pub fn with_timers(engine: Arc<SyncEngine>, debounce: Duration, interval: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine,
                state: Mutex::new(None),
                password: Mutex::new(None),
                generation: AtomicU64::new(0),
                edit_seq: AtomicU64::new(0),
                debounce,
                interval,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    /// Opens a note, superseding whatever was open before.
    ///
    /// Returns the resolved note; the session buffer holds its plaintext.
    pub async fn open(&self, id: &NoteId) -> Result<Note, SessionError> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = SyncContext::with_password(inner.password());

        let note = inner.engine.load(id, &ctx).await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return Err(SessionError::Superseded);
        }

        let text = inner.display_text(&note).await?;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return Err(SessionError::Superseded);
        }

        *inner.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(OpenNote {
            id: note.id.clone(),
            encrypted: note.encrypted,
            buffer: text.clone(),
            last_saved: Some(text.clone()),
            opened_snapshot: text,
        });
        SessionInner::spawn_interval_autosave(inner, generation);
        Ok(note)
    }

    /// Buffers new content and arms the debounce timer. Nothing is
    /// persisted until a flush fires.
    pub fn edit(&self, content: impl Into<String>) -> Result<(), SessionError> {
        let inner = &self.inner;
        let content = content.into();
        {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_mut().ok_or(SessionError::NoOpenNote)?;
            open.buffer = content;
        }
        let seq = inner.edit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = inner.generation.load(Ordering::SeqCst);
        let task = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(task.debounce).await;
            // only the timer of the latest edit flushes
            if task.generation.load(Ordering::SeqCst) == generation
                && task.edit_seq.load(Ordering::SeqCst) == seq
            {
                if let Err(e) = task.flush().await {
                    tracing::warn!("debounced autosave failed: {}", e);
                }
            }
        });
        Ok(())
    }

    /// Persists the buffer now. Idempotent: with no change since the last
    /// successful save this performs no write at all.
    ///
    /// Returns whether a save actually happened.
    pub async fn flush(&self) -> Result<bool, SessionError> {
        self.inner.flush().await
    }

    /// Re-runs the load for the open note, enabling the refresh no-op path
    /// when the buffer is unmodified since open.
    pub async fn refresh(&self) -> Result<Note, SessionError> {
        let inner = &self.inner;

        // push pending edits first so reconciliation sees real state
        inner.flush().await?;

        let (id, displayed, unmodified) = {
            let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_ref().ok_or(SessionError::NoOpenNote)?;
            (
                open.id.clone(),
                open.buffer.clone(),
                open.buffer == open.opened_snapshot,
            )
        };

        let ctx = SyncContext {
            password: inner.password(),
            refresh_displayed: unmodified.then_some(displayed),
        };
        let generation = inner.generation.load(Ordering::SeqCst);
        let note = inner.engine.load(&id, &ctx).await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return Err(SessionError::Superseded);
        }

        let text = inner.display_text(&note).await?;
        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = state.as_mut() {
            if open.id == id {
                open.buffer = text.clone();
                open.last_saved = Some(text.clone());
                open.opened_snapshot = text;
                open.encrypted = note.encrypted;
            }
        }
        Ok(note)
    }

    /// Marks the open note for encryption (or clears it). Takes effect on
    /// the next flush.
    pub fn set_encrypted(&self, encrypted: bool) -> Result<(), SessionError> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let open = state.as_mut().ok_or(SessionError::NoOpenNote)?;
        if open.encrypted != encrypted {
            open.encrypted = encrypted;
            open.last_saved = None;
        }
        Ok(())
    }

    pub fn set_password(&self, password: impl Into<String>) {
        self.inner.set_password(password.into());
    }

    pub fn clear_password(&self) {
        *self
            .inner
            .password
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current_id(&self) -> Option<NoteId> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|open| open.id.clone())
    }

    /// Plaintext currently in the edit buffer.
    pub fn current_text(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|open| open.buffer.clone())
    }

    /// Closes the open note and cancels its timers. The password stays for
    /// the rest of the session.
    pub fn close(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SessionInner {
    fn password(&self) -> Option<String> {
        self.password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_password(&self, password: String) {
        *self.password.lock().unwrap_or_else(PoisonError::into_inner) = Some(password);
    }

    async fn flush(&self) -> Result<bool, SessionError> {
        let (id, encrypted, buffer) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let open = state.as_ref().ok_or(SessionError::NoOpenNote)?;
            if open.last_saved.as_deref() == Some(open.buffer.as_str()) {
                return Ok(false);
            }
            (open.id.clone(), open.encrypted, open.buffer.clone())
        };

        let ctx = SyncContext::with_password(self.password());
        let saved = self.engine.save(&id, &buffer, encrypted, &ctx).await?;

        // a concurrent writer may have won, or a merge may have happened;
        // the persisted text is then not what we sent
        let saved_text = if saved.encrypted {
            self.password()
                .and_then(|pw| crypto::decrypt(&saved.content, &pw).ok())
        } else {
            Some(saved.content.clone())
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = state.as_mut() {
            if open.id == id {
                match saved_text {
                    Some(text) if text != buffer => {
                        // adopt the winner, unless the user typed meanwhile
                        if open.buffer == buffer {
                            open.buffer = text.clone();
                        }
                        open.last_saved = Some(text);
                    }
                    _ => open.last_saved = Some(buffer),
                }
            }
        }
        Ok(true)
    }

    /// Plaintext for display. Wrong or missing passwords re-prompt a
    /// bounded number of times; the stored ciphertext is never altered.
    async fn display_text(&self, note: &Note) -> Result<String, SessionError> {
        if !note.encrypted {
            return Ok(note.content.clone());
        }
        if let Some(password) = self.password() {
            if let Ok(text) = crypto::decrypt(&note.content, &password) {
                return Ok(text);
            }
            tracing::warn!("session password does not decrypt {}", note.id);
        }
        let prompter = self.engine.prompter();
        for _ in 0..PASSWORD_RETRIES {
            let Some(password) = prompter.prompt_password().await else {
                break;
            };
            match crypto::decrypt(&note.content, &password) {
                Ok(text) => {
                    self.set_password(password);
                    return Ok(text);
                }
                Err(_) => tracing::warn!("wrong password for {}", note.id),
            }
        }
        Err(SessionError::DecryptionFailed)
    }

    fn spawn_interval_autosave(this: &Arc<Self>, generation: u64) {
        let task = Arc::clone(this);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(task.interval).await;
                if task.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                match task.flush().await {
                    Ok(_) => {}
                    Err(SessionError::NoOpenNote) => break,
                    Err(e) => tracing::warn!("periodic autosave failed: {}", e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::prompt::{ConflictChoice, Prompter};
    use crate::remote::RemoteStore;
    use crate::sync::EngineConfig;
    use crate::testing::{MemoryRemote, ScriptedPrompter};
    use chrono::Utc;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tempfile::TempDir;

    struct Fixture {
        session: NoteSession,
        remote: Arc<MemoryRemote>,
        prompter: Arc<ScriptedPrompter>,
        _temp: TempDir,
    }

    fn fixture_with(prompter: ScriptedPrompter) -> Fixture {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::new(temp.path().to_path_buf());
        let remote = Arc::new(MemoryRemote::new());
        let prompter = Arc::new(prompter);
        let engine = Arc::new(SyncEngine::with_config(
            cache,
            Some(remote.clone() as Arc<dyn RemoteStore>),
            prompter.clone() as Arc<dyn Prompter>,
            EngineConfig {
                remote_timeout: Duration::from_millis(500),
                push_failure_ceiling: 3,
            },
        ));
        let session = NoteSession::with_timers(
            engine,
            Duration::from_millis(25),
            Duration::from_millis(60),
        );
        Fixture {
            session,
            remote,
            prompter,
            _temp: temp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedPrompter::new(ConflictChoice::Local))
    }

    #[tokio::test]
    async fn test_open_unknown_id_yields_empty_note() {
        let f = fixture();
        let id = NoteId::generate();
        let note = f.session.open(&id).await.unwrap();
        assert_eq!(note.id, id);
        assert_eq!(f.session.current_text().unwrap(), "");
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let f = fixture();
        let id = NoteId::generate();
        f.session.open(&id).await.unwrap();

        f.session.edit("some text").unwrap();
        assert!(f.session.flush().await.unwrap());
        let updates_after_first = f.remote.update_calls.load(AtomicOrdering::SeqCst);

        // no intervening edit: at most one remote write total
        assert!(!f.session.flush().await.unwrap());
        assert_eq!(
            f.remote.update_calls.load(AtomicOrdering::SeqCst),
            updates_after_first
        );
    }

    #[tokio::test]
    async fn test_flush_without_open_note_fails() {
        let f = fixture();
        assert!(matches!(
            f.session.flush().await,
            Err(SessionError::NoOpenNote)
        ));
    }

    #[tokio::test]
    async fn test_debounced_autosave_fires_after_quiescence() {
        let f = fixture();
        let id = NoteId::generate();
        f.session.open(&id).await.unwrap();

        f.session.edit("typed and paused").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cached = f.session.engine().cache().get(&id).unwrap().unwrap();
        assert_eq!(cached.content, "typed and paused");
    }

    #[tokio::test]
    async fn test_rapid_edits_coalesce_into_one_save() {
        let f = fixture();
        let id = NoteId::generate();
        f.session.open(&id).await.unwrap();

        for i in 0..5 {
            f.session.edit(format!("draft {}", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cached = f.session.engine().cache().get(&id).unwrap().unwrap();
        assert_eq!(cached.content, "draft 4");
    }

    #[tokio::test]
    async fn test_superseded_open_is_abandoned() {
        let f = fixture();
        let id_slow = NoteId::generate();
        let id_fast = NoteId::generate();
        f.remote.insert(&id_slow, "slow note", false, Utc::now());
        f.remote.set_delay(Some(Duration::from_millis(150)));

        let session = f.session.clone();
        let slow_id = id_slow.clone();
        let slow = tokio::spawn(async move { session.open(&slow_id).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        f.remote.set_delay(None);
        f.session.open(&id_fast).await.unwrap();

        let slow_result = slow.await.unwrap();
        assert!(matches!(slow_result, Err(SessionError::Superseded)));
        assert_eq!(f.session.current_id().unwrap(), id_fast);
    }

    #[tokio::test]
    async fn test_encrypted_flush_stores_envelope() {
        let f = fixture();
        let id = NoteId::generate();
        f.session.open(&id).await.unwrap();
        f.session.set_password("pw");
        f.session.set_encrypted(true).unwrap();
        f.session.edit("secret body").unwrap();

        f.session.flush().await.unwrap();

        let cached = f.session.engine().cache().get(&id).unwrap().unwrap();
        assert!(cached.encrypted);
        assert!(crypto::is_envelope(&cached.content));
        assert_eq!(
            crypto::decrypt(&cached.content, "pw").unwrap(),
            "secret body"
        );
    }

    #[tokio::test]
    async fn test_open_encrypted_note_prompts_for_password() {
        let f = fixture_with(ScriptedPrompter::with_password(
            ConflictChoice::Local,
            "letmein",
        ));
        let id = NoteId::generate();
        let envelope = crypto::encrypt("hidden text", "letmein").unwrap();
        let mut note = Note::new(id.clone());
        note.content = envelope;
        note.encrypted = true;
        f.session.engine().cache().put(&note).unwrap();

        f.session.open(&id).await.unwrap();

        assert_eq!(f.prompter.password_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(f.session.current_text().unwrap(), "hidden text");
    }

    #[tokio::test]
    async fn test_open_encrypted_note_wrong_password_fails_cleanly() {
        let f = fixture_with(ScriptedPrompter::with_password(
            ConflictChoice::Local,
            "wrong",
        ));
        let id = NoteId::generate();
        let envelope = crypto::encrypt("hidden text", "right").unwrap();
        let mut note = Note::new(id.clone());
        note.content = envelope.clone();
        note.encrypted = true;
        f.session.engine().cache().put(&note).unwrap();

        let result = f.session.open(&id).await;

        assert!(matches!(result, Err(SessionError::DecryptionFailed)));
        // ciphertext untouched
        let cached = f.session.engine().cache().get(&id).unwrap().unwrap();
        assert_eq!(cached.content, envelope);
    }

    #[tokio::test]
    async fn test_refresh_adopts_remote_continuation() {
        let f = fixture();
        let id = NoteId::generate();
        f.remote.insert(&id, "hello", false, Utc::now());
        f.session.open(&id).await.unwrap();

        // another device keeps typing
        f.remote.insert(&id, "hello world", false, Utc::now());
        f.session.refresh().await.unwrap();

        assert_eq!(f.session.current_text().unwrap(), "hello world");
        assert_eq!(f.prompter.conflict_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_edit_without_open_note_fails() {
        let f = fixture();
        assert!(matches!(
            f.session.edit("orphan"),
            Err(SessionError::NoOpenNote)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_autosave() {
        let f = fixture();
        let id = NoteId::generate();
        f.session.open(&id).await.unwrap();
        f.session.edit("about to close").unwrap();
        f.session.close();

        tokio::time::sleep(Duration::from_millis(200)).await;

        // the debounced flush was cancelled by the generation bump
        let cached = f.session.engine().cache().get(&id).unwrap().unwrap();
        assert_eq!(cached.content, "");
        assert!(f.session.current_id().is_none());
    }
}
