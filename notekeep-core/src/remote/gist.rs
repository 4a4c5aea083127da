//! GitHub Gist-backed note store.
//!
//! Each note lives in its own secret gist as a single file. The filename
//! carries the encrypted flag (`note.txt` vs `note.enc`) since gists have no
//! custom metadata fields. Gist identifiers are server-assigned; a created
//! note adopts the identifier the API returns.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{
    status_error, transport_error, with_retries, Created, Fetched, RemoteError, RemoteNote,
    RemoteStore,
};
use crate::note_id::NoteId;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const PLAIN_FILENAME: &str = "note.txt";
const ENCRYPTED_FILENAME: &str = "note.enc";
const USER_AGENT: &str = "notekeep";
const GIST_DESCRIPTION: &str = "notekeep note";

/// Remote store over the GitHub Gist API.
pub struct GistStore {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct GistResponse {
    id: String,
    updated_at: DateTime<Utc>,
    files: HashMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    content: Option<String>,
}

impl GistStore {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    /// Points the adapter at a different API base (tests, GitHub Enterprise).
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn gist_url(&self, id: &NoteId) -> String {
        format!("{}/gists/{}", self.api_base, id)
    }

    fn gists_url(&self) -> String {
        format!("{}/gists", self.api_base)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    fn filename(encrypted: bool) -> &'static str {
        if encrypted {
            ENCRYPTED_FILENAME
        } else {
            PLAIN_FILENAME
        }
    }

    /// Body for create/update. The stale filename is nulled out so a flipped
    /// encryption flag does not leave both files behind.
    fn files_payload(content: &str, encrypted: bool) -> serde_json::Value {
        let mut files = serde_json::Map::new();
        files.insert(
            Self::filename(encrypted).to_string(),
            json!({ "content": content }),
        );
        files.insert(
            Self::filename(!encrypted).to_string(),
            serde_json::Value::Null,
        );
        serde_json::Value::Object(files)
    }

    fn project(gist: GistResponse) -> Result<RemoteNote, RemoteError> {
        let (encrypted, file) = if let Some(file) = gist.files.get(ENCRYPTED_FILENAME) {
            (true, file)
        } else if let Some(file) = gist.files.get(PLAIN_FILENAME) {
            (false, file)
        } else {
            return Err(RemoteError::Protocol(format!(
                "gist {} holds no note file",
                gist.id
            )));
        };
        Ok(RemoteNote {
            content: file.content.clone().unwrap_or_default(),
            encrypted,
            updated_at: gist.updated_at,
        })
    }

    async fn create_once(&self, content: &str, encrypted: bool) -> Result<Created, RemoteError> {
        let body = json!({
            "description": GIST_DESCRIPTION,
            "public": false,
            "files": Self::files_payload(content, encrypted),
        });
        let response = self
            .request(self.client.post(self.gists_url()))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let gist: GistResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        let id = NoteId::parse(&gist.id)
            .map_err(|e| RemoteError::Protocol(format!("unusable gist id: {}", e)))?;
        Ok(Created {
            id,
            updated_at: gist.updated_at,
        })
    }
}

#[async_trait]
impl RemoteStore for GistStore {
    async fn fetch(&self, id: &NoteId) -> Result<Fetched, RemoteError> {
        with_retries("gist fetch", || async move {
            let response = self
                .request(self.client.get(self.gist_url(id)))
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(Fetched::NotFound);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }

            let gist: GistResponse = response
                .json()
                .await
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            Ok(Fetched::Found(Self::project(gist)?))
        })
        .await
    }

    async fn create(
        &self,
        id: Option<&NoteId>,
        content: &str,
        encrypted: bool,
    ) -> Result<Created, RemoteError> {
        // The Gist API assigns identifiers; a requested id cannot be pinned.
        if let Some(requested) = id {
            tracing::debug!(
                "gist backend assigns its own ids, requested {} will be replaced",
                requested
            );
        }
        with_retries("gist create", || self.create_once(content, encrypted)).await
    }

    async fn update(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
    ) -> Result<DateTime<Utc>, RemoteError> {
        let updated = with_retries("gist update", || async move {
            let body = json!({ "files": Self::files_payload(content, encrypted) });
            let response = self
                .request(self.client.patch(self.gist_url(id)))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }

            let gist: GistResponse = response
                .json()
                .await
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            Ok(Some(gist.updated_at))
        })
        .await?;

        match updated {
            Some(at) => Ok(at),
            None => {
                // Vanished remotely; recreate rather than surface not-found.
                tracing::warn!("gist {} no longer exists, recreating", id);
                let created = with_retries("gist create", || self.create_once(content, encrypted))
                    .await?;
                Ok(created.updated_at)
            }
        }
    }

    fn is_available(&self) -> bool {
        !self.token.is_empty()
    }
}
