//! The sync engine.
//!
//! Per note identifier, decides which of the local and remote copies is
//! authoritative, detects divergence, resolves it automatically or through
//! the conflict prompt, and keeps the local cache converging toward the
//! remote store. The cache is always written first; the product guarantee
//! is that a note is never lost locally, not that it is always synced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::timeout;

use super::divergence::{classify, merge_contents, Divergence};
use crate::cache::{CacheError, LocalCache};
use crate::crypto::{self, CryptoError};
use crate::note::{advance_past, Note, Provenance};
use crate::note_id::NoteId;
use crate::prompt::{ConflictChoice, Prompter};
use crate::remote::{Fetched, RemoteError, RemoteNote, RemoteStore};

/// Default bound on a single remote adapter call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(8);
/// Default number of consecutive push failures tolerated before the failure
/// is reported at error level.
pub const DEFAULT_PUSH_FAILURE_CEILING: u32 = 5;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub remote_timeout: Duration,
    pub push_failure_ceiling: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            push_failure_ceiling: DEFAULT_PUSH_FAILURE_CEILING,
        }
    }
}

/// Sync lifecycle of a single note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Unsynced,
    Syncing,
    Synced,
    /// A conflict prompt is outstanding; resolution needs user input.
    ConflictPending,
    /// The last push failed; retried on the next save or on
    /// [`SyncEngine::connectivity_restored`].
    SyncFailed,
}

/// Per-operation session context.
///
/// Carries the session password (held in memory by the note session, never
/// persisted) and, for refresh loads, the content currently displayed.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub password: Option<String>,
    /// Set when this load is an explicit refresh of an already-open note
    /// whose content has not changed locally since it was opened.
    pub refresh_displayed: Option<String>,
}

impl SyncContext {
    pub fn with_password(password: Option<String>) -> Self {
        Self {
            password,
            refresh_displayed: None,
        }
    }
}

/// Errors a save can surface. Remote failures are absorbed; only local
/// persistence and encryption problems reach the caller.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("a password is required to save an encrypted note")]
    PasswordRequired,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Both sides of a note rendered comparable.
///
/// `plaintext` is true when both sides are real text (decrypted or never
/// encrypted); false means an opaque byte comparison of raw envelopes,
/// which still detects divergence but cannot merge.
struct Comparable {
    local: String,
    remote: String,
    plaintext: bool,
}

fn comparable(local: &Note, remote: &RemoteNote, password: Option<&str>) -> Comparable {
    let local_text = if local.encrypted {
        password.and_then(|pw| crypto::decrypt(&local.content, pw).ok())
    } else {
        Some(local.content.clone())
    };
    let remote_text = if remote.encrypted {
        password.and_then(|pw| crypto::decrypt(&remote.content, pw).ok())
    } else {
        Some(remote.content.clone())
    };
    match (local_text, remote_text) {
        (Some(local), Some(remote)) => Comparable {
            local,
            remote,
            plaintext: true,
        },
        _ => Comparable {
            local: local.content.clone(),
            remote: remote.content.clone(),
            plaintext: false,
        },
    }
}

fn adopt_remote(local: &Note, remote: &RemoteNote) -> Note {
    Note {
        id: local.id.clone(),
        content: remote.content.clone(),
        encrypted: remote.encrypted,
        created_at: local.created_at,
        updated_at: remote.updated_at,
        provenance: Provenance::SyncedFromRemote,
    }
}

/// Orchestrates load and save across the local cache and the remote store.
pub struct SyncEngine {
    cache: LocalCache,
    remote: Option<Arc<dyn RemoteStore>>,
    prompter: Arc<dyn Prompter>,
    remote_timeout: Duration,
    push_failure_ceiling: u32,
    /// Flipped by an authentication failure; remote stays off for the rest
    /// of the session unless connectivity is explicitly restored.
    remote_disabled: AtomicBool,
    /// Per-note operation locks: at most one load or save in flight per id.
    locks: Mutex<HashMap<NoteId, Arc<tokio::sync::Mutex<()>>>>,
    statuses: Mutex<HashMap<NoteId, SyncStatus>>,
    push_failures: Mutex<HashMap<NoteId, u32>>,
}

impl SyncEngine {
    pub fn new(
        cache: LocalCache,
        remote: Option<Arc<dyn RemoteStore>>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self::with_config(cache, remote, prompter, EngineConfig::default())
    }

    pub fn with_config(
        cache: LocalCache,
        remote: Option<Arc<dyn RemoteStore>>,
        prompter: Arc<dyn Prompter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            prompter,
            remote_timeout: config.remote_timeout,
            push_failure_ceiling: config.push_failure_ceiling,
            remote_disabled: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            push_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn prompter(&self) -> Arc<dyn Prompter> {
        Arc::clone(&self.prompter)
    }

    /// Current sync status of a note. Notes never seen are `Unsynced`.
    pub fn status(&self, id: &NoteId) -> SyncStatus {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(SyncStatus::Unsynced)
    }

    /// Whether a remote store is configured, available, and not disabled.
    pub fn remote_enabled(&self) -> bool {
        self.usable_remote().is_some()
    }

    /// Clears the auth latch and failure counters, e.g. after credentials
    /// were refreshed or the network came back.
    pub fn connectivity_restored(&self) {
        self.remote_disabled.store(false, Ordering::SeqCst);
        self.push_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Loads a note, reconciling local and remote copies.
    ///
    /// Never fails outright; the worst case is a fresh empty note under the
    /// exact requested identifier.
    pub async fn load(&self, id: &NoteId, ctx: &SyncContext) -> Note {
        let lock = self.note_lock(id);
        let _guard = lock.lock().await;
        self.set_status(id, SyncStatus::Syncing);

        let store = self.usable_remote();
        // both lookups run concurrently; the cache read is instantaneous,
        // the remote fetch suspends on the network
        let (local, fetched) = tokio::join!(
            async {
                match self.cache.get(id) {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!("cache read of {} failed, treating as missing: {}", id, e);
                        None
                    }
                }
            },
            async {
                match &store {
                    Some(store) => self.fetch_remote(store, id).await,
                    None => None,
                }
            }
        );

        match (local, fetched) {
            (Some(local), Some(Fetched::Found(remote))) => {
                self.reconcile(local, remote, ctx).await
            }
            (Some(mut local), fetched) => {
                // local copy only: adopt it, and stop trusting the remote
                // marker until the next successful reconcile
                if local.provenance != Provenance::LocallyModified {
                    local.provenance = Provenance::LocallyModified;
                    if let Err(e) = self.cache.put(&local) {
                        tracing::warn!("cache write of {} failed: {}", local.id, e);
                    }
                }
                match fetched {
                    Some(Fetched::NotFound) => self.try_push(&local).await,
                    None if store.is_some() => self.set_status(id, SyncStatus::SyncFailed),
                    _ => self.set_status(id, SyncStatus::Unsynced),
                }
                local
            }
            (None, Some(Fetched::Found(remote))) => {
                let note = Note {
                    id: id.clone(),
                    content: remote.content,
                    encrypted: remote.encrypted,
                    created_at: remote.updated_at,
                    updated_at: remote.updated_at,
                    provenance: Provenance::SyncedFromRemote,
                };
                if let Err(e) = self.cache.put(&note) {
                    tracing::warn!("cache write of {} failed: {}", id, e);
                }
                self.set_status(id, SyncStatus::Synced);
                note
            }
            (None, fetched) => {
                // recovery path: nothing anywhere; create empty under the
                // requested identifier, never a substitute one
                let note = Note::new(id.clone());
                if let Err(e) = self.cache.put(&note) {
                    tracing::warn!("cache write of {} failed: {}", id, e);
                }
                match (store, fetched) {
                    (Some(store), Some(Fetched::NotFound)) => {
                        self.create_remote(&store, &note).await;
                    }
                    _ => self.set_status(id, SyncStatus::Unsynced),
                }
                note
            }
        }
    }

    /// Persists new content for a note.
    ///
    /// The local write always happens; remote failures never fail the save.
    /// Returns the note as persisted, which may carry remote content when a
    /// concurrent writer on another device won.
    pub async fn save(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
        ctx: &SyncContext,
    ) -> Result<Note, SaveError> {
        let lock = self.note_lock(id);
        let _guard = lock.lock().await;
        self.set_status(id, SyncStatus::Syncing);

        let previous = match self.cache.get(id) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("cache read of {} failed: {}", id, e);
                None
            }
        };
        let created_at = previous
            .as_ref()
            .map(|p| p.created_at)
            .unwrap_or_else(Utc::now);
        let last_updated = previous.as_ref().map(|p| p.updated_at).unwrap_or(created_at);

        let stored = if encrypted {
            let password = ctx.password.as_deref().ok_or(SaveError::PasswordRequired)?;
            crypto::encrypt(content, password)?
        } else {
            content.to_string()
        };

        let mut note = Note {
            id: id.clone(),
            content: stored,
            encrypted,
            created_at,
            updated_at: advance_past(last_updated),
            provenance: Provenance::LocallyModified,
        };

        // write through locally first: the guaranteed fallback. Quota
        // exhaustion is reported only after the remote had its chance.
        let cache_result = self.cache.put(&note);
        if let Err(e) = &cache_result {
            tracing::warn!("local save of {} failed: {}", id, e);
        }

        if let Some(store) = self.usable_remote() {
            match self.fetch_remote(&store, id).await {
                Some(Fetched::Found(current)) => {
                    note = self.resolve_concurrent_writer(note, current, ctx).await;
                }
                Some(Fetched::NotFound) => self.try_push(&note).await,
                None => self.record_push_failure(id, "remote unreachable before push"),
            }
        } else {
            self.set_status(id, SyncStatus::Unsynced);
        }

        cache_result?;
        Ok(note)
    }

    /// Both copies exist and may differ; decide which one wins.
    async fn reconcile(&self, local: Note, remote: RemoteNote, ctx: &SyncContext) -> Note {
        let cmp = comparable(&local, &remote, ctx.password.as_deref());

        let resolved = match classify(&cmp.local, &cmp.remote) {
            Divergence::Identical => {
                // ties favour remote: it is the canonical multi-device source
                if remote.updated_at >= local.updated_at {
                    adopt_remote(&local, &remote)
                } else {
                    local
                }
            }
            Divergence::RemoteExtendsLocal => adopt_remote(&local, &remote),
            Divergence::LocalExtendsRemote => local,
            Divergence::Conflict => {
                if let Some(displayed) = &ctx.refresh_displayed {
                    if displayed.trim() == cmp.remote.trim() {
                        // refresh noise: remote already matches what is on
                        // screen; keep current state without prompting
                        self.set_status(&local.id, SyncStatus::Synced);
                        return local;
                    }
                }
                self.set_status(&local.id, SyncStatus::ConflictPending);
                match self.prompter.prompt_conflict(&cmp.local, &cmp.remote).await {
                    ConflictChoice::Local => local,
                    ConflictChoice::Remote => adopt_remote(&local, &remote),
                    ConflictChoice::Merge => match self.merge_notes(&local, &remote, &cmp, ctx) {
                        Some(merged) => merged,
                        None => local,
                    },
                }
            }
        };

        if let Err(e) = self.cache.put(&resolved) {
            tracing::warn!("cache write of {} failed: {}", resolved.id, e);
        }
        if resolved.content != remote.content {
            self.try_push(&resolved).await;
        } else {
            self.reset_push_failures(&resolved.id);
            self.set_status(&resolved.id, SyncStatus::Synced);
        }
        resolved
    }

    /// Guards a save against a writer on another device that raced ahead
    /// between our last load and this save.
    async fn resolve_concurrent_writer(
        &self,
        note: Note,
        current: RemoteNote,
        ctx: &SyncContext,
    ) -> Note {
        let cmp = comparable(&note, &current, ctx.password.as_deref());
        match classify(&cmp.local, &cmp.remote) {
            Divergence::Identical => {
                // remote already holds this content; nothing to push
                self.reset_push_failures(&note.id);
                self.set_status(&note.id, SyncStatus::Synced);
                note
            }
            Divergence::LocalExtendsRemote => {
                self.try_push(&note).await;
                note
            }
            Divergence::RemoteExtendsLocal => {
                // the other device kept typing past us: remote wins, this
                // save is aborted
                let adopted = adopt_remote(&note, &current);
                if let Err(e) = self.cache.put(&adopted) {
                    tracing::warn!("cache write of {} failed: {}", adopted.id, e);
                }
                self.set_status(&adopted.id, SyncStatus::Synced);
                adopted
            }
            Divergence::Conflict => {
                self.set_status(&note.id, SyncStatus::ConflictPending);
                match self.prompter.prompt_conflict(&cmp.local, &cmp.remote).await {
                    ConflictChoice::Local => {
                        self.try_push(&note).await;
                        note
                    }
                    ConflictChoice::Remote => {
                        let adopted = adopt_remote(&note, &current);
                        if let Err(e) = self.cache.put(&adopted) {
                            tracing::warn!("cache write of {} failed: {}", adopted.id, e);
                        }
                        self.set_status(&adopted.id, SyncStatus::Synced);
                        adopted
                    }
                    ConflictChoice::Merge => match self.merge_notes(&note, &current, &cmp, ctx) {
                        Some(merged) => {
                            if let Err(e) = self.cache.put(&merged) {
                                tracing::warn!("cache write of {} failed: {}", merged.id, e);
                            }
                            self.try_push(&merged).await;
                            merged
                        }
                        None => {
                            self.try_push(&note).await;
                            note
                        }
                    },
                }
            }
        }
    }

    /// Builds the merged note, or `None` when merging is impossible
    /// (undecryptable content) and the keep-local outcome applies.
    fn merge_notes(
        &self,
        local: &Note,
        remote: &RemoteNote,
        cmp: &Comparable,
        ctx: &SyncContext,
    ) -> Option<Note> {
        if !cmp.plaintext {
            tracing::warn!(
                "cannot merge undecryptable content for {}, keeping local",
                local.id
            );
            return None;
        }
        let merged_plain = merge_contents(&cmp.local, &cmp.remote, Utc::now());
        let content = if local.encrypted {
            let password = ctx.password.as_deref()?;
            match crypto::encrypt(&merged_plain, password) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("re-encrypting merged content for {} failed: {}", local.id, e);
                    return None;
                }
            }
        } else {
            merged_plain
        };
        Some(Note {
            id: local.id.clone(),
            content,
            encrypted: local.encrypted,
            created_at: local.created_at,
            updated_at: advance_past(local.updated_at.max(remote.updated_at)),
            provenance: Provenance::LocallyModified,
        })
    }

    /// Best-effort push of a note to the remote store. Failures are logged
    /// and counted, never surfaced.
    async fn try_push(&self, note: &Note) {
        let Some(store) = self.usable_remote() else {
            self.set_status(&note.id, SyncStatus::Unsynced);
            return;
        };
        match timeout(
            self.remote_timeout,
            store.update(&note.id, &note.content, note.encrypted),
        )
        .await
        {
            Ok(Ok(_)) => {
                self.reset_push_failures(&note.id);
                self.set_status(&note.id, SyncStatus::Synced);
            }
            Ok(Err(e)) if e.is_auth() => {
                self.disable_remote(&e);
                self.set_status(&note.id, SyncStatus::SyncFailed);
            }
            Ok(Err(e)) => self.record_push_failure(&note.id, &e.to_string()),
            Err(_) => self.record_push_failure(&note.id, "push timed out"),
        }
    }

    /// Best-effort creation of a brand-new note remotely.
    async fn create_remote(&self, store: &Arc<dyn RemoteStore>, note: &Note) {
        match timeout(
            self.remote_timeout,
            store.create(Some(&note.id), &note.content, note.encrypted),
        )
        .await
        {
            Ok(Ok(_)) => self.set_status(&note.id, SyncStatus::Synced),
            Ok(Err(e)) => {
                if e.is_auth() {
                    self.disable_remote(&e);
                } else {
                    tracing::debug!("remote create of {} failed: {}", note.id, e);
                }
                self.set_status(&note.id, SyncStatus::Unsynced);
            }
            Err(_) => {
                tracing::debug!("remote create of {} timed out", note.id);
                self.set_status(&note.id, SyncStatus::Unsynced);
            }
        }
    }

    async fn fetch_remote(&self, store: &Arc<dyn RemoteStore>, id: &NoteId) -> Option<Fetched> {
        match timeout(self.remote_timeout, store.fetch(id)).await {
            Ok(Ok(fetched)) => Some(fetched),
            Ok(Err(e)) if e.is_auth() => {
                self.disable_remote(&e);
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("remote fetch of {} failed: {}", id, e);
                None
            }
            Err(_) => {
                tracing::warn!("remote fetch of {} timed out", id);
                None
            }
        }
    }

    fn usable_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        if self.remote_disabled.load(Ordering::SeqCst) {
            return None;
        }
        self.remote.as_ref().filter(|r| r.is_available()).cloned()
    }

    fn disable_remote(&self, why: &RemoteError) {
        if !self.remote_disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("remote store disabled for this session: {}", why);
        }
    }

    fn note_lock(&self, id: &NoteId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    fn set_status(&self, id: &NoteId, status: SyncStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), status);
    }

    fn record_push_failure(&self, id: &NoteId, why: &str) {
        let count = {
            let mut failures = self
                .push_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = failures.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.set_status(id, SyncStatus::SyncFailed);
        if count == self.push_failure_ceiling {
            tracing::error!(
                "giving up on pushing {} after {} consecutive failures: {}",
                id,
                count,
                why
            );
        } else {
            tracing::warn!("push of {} failed (attempt {}): {}", id, count, why);
        }
    }

    fn reset_push_failures(&self, id: &NoteId) {
        self.push_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}
