//! Remote note stores.
//!
//! Both backends implement [`RemoteStore`]; the sync engine only ever talks
//! to the trait. Which implementation is constructed is a configuration-time
//! decision, never a runtime swap.
//!
//! Transient network failures are retried inside the adapters with bounded
//! exponential backoff before an error surfaces. Authentication failures are
//! surfaced distinctly and never retried.

mod firebase;
mod gist;

pub use firebase::FirebaseStore;
pub use gist::GistStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::note_id::NoteId;

/// Errors surfaced by a remote store after internal retries are exhausted.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The credential was rejected. Retrying is futile; callers should stop
    /// talking to the remote for the rest of the session.
    #[error("authentication rejected by remote store: {0}")]
    Auth(String),

    /// Connection, timeout, or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered with something the adapter cannot interpret.
    #[error("unexpected response from remote store: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }
}

/// The adapter's normalized projection of a remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNote {
    pub content: String,
    pub encrypted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a fetch. Not-found is a first-class outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Found(RemoteNote),
    NotFound,
}

/// Result of creating a remote record.
///
/// Backends that assign their own identifiers (gists) report the identifier
/// they chose here.
#[derive(Debug, Clone)]
pub struct Created {
    pub id: NoteId,
    pub updated_at: DateTime<Utc>,
}

/// Uniform contract over a remote note store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, id: &NoteId) -> Result<Fetched, RemoteError>;

    /// Creates a remote record. `id` is a request, not a guarantee; the
    /// returned [`Created`] carries the identifier the backend actually used.
    async fn create(
        &self,
        id: Option<&NoteId>,
        content: &str,
        encrypted: bool,
    ) -> Result<Created, RemoteError>;

    /// Updates a remote record. When the identifier does not exist remotely
    /// this MUST fall back to creating it; callers never see not-found here.
    async fn update(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
    ) -> Result<DateTime<Utc>, RemoteError>;

    /// Synchronous capability check (credential presence, configuration).
    /// The engine skips the remote entirely when this is false.
    fn is_available(&self) -> bool;
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_JITTER_MS: u64 = 100;

/// Runs `op`, retrying network failures with exponential backoff plus
/// jitter. Auth and protocol errors pass through on the first attempt.
pub(crate) async fn with_retries<T, F, Fut>(what: &str, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RemoteError::Network(e)) if attempt < RETRY_ATTEMPTS => {
                let jitter = Duration::from_millis(rand::rng().random_range(0..RETRY_JITTER_MS));
                tracing::debug!(
                    "{}: attempt {}/{} failed ({}), retrying",
                    what,
                    attempt,
                    RETRY_ATTEMPTS,
                    e
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Maps a reqwest transport error onto the retryable taxonomy.
pub(crate) fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Network(e.to_string())
}

/// Maps a non-success HTTP status onto the taxonomy. 404 is handled by the
/// callers before this is reached.
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> RemoteError {
    use reqwest::StatusCode;
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Auth(format!("{}: {}", status, truncate(body, 200)))
        }
        s if s.is_server_error() => RemoteError::Network(format!("server returned {}", s)),
        s => RemoteError::Protocol(format!("server returned {}: {}", s, truncate(body, 200))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = with_retries("op", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_network_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retries("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RemoteError::Network("connection reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retries("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Network("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_with_retries_never_retries_auth() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retries("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Auth("bad token".into())) }
        })
        .await;
        assert!(matches!(result, Err(RemoteError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_error_classification() {
        use reqwest::StatusCode;
        assert!(status_error(StatusCode::UNAUTHORIZED, "").is_auth());
        assert!(status_error(StatusCode::FORBIDDEN, "").is_auth());
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            RemoteError::Network(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "nope"),
            RemoteError::Protocol(_)
        ));
    }
}
