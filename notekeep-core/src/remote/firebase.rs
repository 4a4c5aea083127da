//! Firebase Realtime Database-backed note store.
//!
//! Notes live under `<base>/notes/<id>.json` as small JSON documents. The
//! REST surface is plain GET/PUT with the auth token as a query parameter;
//! a GET of a missing path answers `null`, and PUT is an upsert, so the
//! update-falls-back-to-create contract holds by construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    status_error, transport_error, with_retries, Created, Fetched, RemoteError, RemoteNote,
    RemoteStore,
};
use crate::note_id::NoteId;

/// Remote store over a Firebase-style REST document tree.
pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

/// Wire format of a stored note document.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct NoteDocument {
    content: String,
    encrypted: bool,
    updated_at: DateTime<Utc>,
}

impl FirebaseStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn note_url(&self, id: &NoteId) -> String {
        format!(
            "{}/notes/{}.json",
            self.base_url,
            urlencoding::encode(id.as_str())
        )
    }

    fn auth_query(&self) -> Vec<(&'static str, &str)> {
        if self.token.is_empty() {
            Vec::new()
        } else {
            vec![("auth", self.token.as_str())]
        }
    }

    async fn put_document(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
    ) -> Result<DateTime<Utc>, RemoteError> {
        let updated_at = Utc::now();
        let doc = NoteDocument {
            content: content.to_string(),
            encrypted,
            updated_at,
        };
        let doc = &doc;
        with_retries("firebase put", || async move {
            let response = self
                .client
                .put(self.note_url(id))
                .query(&self.auth_query())
                .json(doc)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }
            Ok(())
        })
        .await?;
        Ok(updated_at)
    }
}

#[async_trait]
impl RemoteStore for FirebaseStore {
    async fn fetch(&self, id: &NoteId) -> Result<Fetched, RemoteError> {
        with_retries("firebase fetch", || async move {
            let response = self
                .client
                .get(self.note_url(id))
                .query(&self.auth_query())
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }

            let body = response.text().await.map_err(transport_error)?;
            // a missing path answers the literal `null`
            if body.trim() == "null" {
                return Ok(Fetched::NotFound);
            }
            let doc: NoteDocument = serde_json::from_str(&body)
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            Ok(Fetched::Found(RemoteNote {
                content: doc.content,
                encrypted: doc.encrypted,
                updated_at: doc.updated_at,
            }))
        })
        .await
    }

    async fn create(
        &self,
        id: Option<&NoteId>,
        content: &str,
        encrypted: bool,
    ) -> Result<Created, RemoteError> {
        let id = match id {
            Some(id) => id.clone(),
            None => NoteId::generate(),
        };
        let updated_at = self.put_document(&id, content, encrypted).await?;
        Ok(Created { id, updated_at })
    }

    async fn update(
        &self,
        id: &NoteId,
        content: &str,
        encrypted: bool,
    ) -> Result<DateTime<Utc>, RemoteError> {
        self.put_document(id, content, encrypted).await
    }

    fn is_available(&self) -> bool {
        !self.base_url.is_empty() && !self.token.is_empty()
    }
}
