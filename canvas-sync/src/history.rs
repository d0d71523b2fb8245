//! History store client.
//!
//! The store keeps each session's `DrawSegment`s in append order. The engine
//! only reads, appends, and deletes whole sessions; entries are never edited.
//!
//! HTTP contract of [`HttpHistoryStore`]:
//! ```text
//! GET    {base}/sessions/{sessionId}/history  → 200 [DrawSegment, ...]  (404 = empty)
//! POST   {base}/sessions/{sessionId}/history  ← DrawSegment
//! DELETE {base}/sessions/{sessionId}/history  → 2xx
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio::sync::RwLock;

use crate::config::DEFAULT_HISTORY_TIMEOUT_MS;
use crate::error::{Result, SyncError};
use crate::event::DrawSegment;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Past segments of a session, oldest first.
    async fn fetch(&self, session_id: &str) -> Result<Vec<DrawSegment>>;

    /// Append one segment to its session's history.
    async fn append(&self, segment: &DrawSegment) -> Result<()>;

    /// Drop a session's history.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// In-process history store.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    sessions: RwLock<HashMap<String, Vec<DrawSegment>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session's history.
    pub fn with_history(session_id: impl Into<String>, segments: Vec<DrawSegment>) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(session_id.into(), segments);
        Self {
            sessions: RwLock::new(sessions),
        }
    }

    pub async fn len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn fetch(&self, session_id: &str) -> Result<Vec<DrawSegment>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, segment: &DrawSegment) -> Result<()> {
        self.sessions
            .write()
            .await
            .entry(segment.session_id.clone())
            .or_default()
            .push(segment.clone());
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}

/// History store reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHistoryStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpHistoryStore {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_millis(DEFAULT_HISTORY_TIMEOUT_MS))
    }

    /// Store whose requests give up after `timeout`.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("history url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!("history url {base_url} cannot be a base")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("history client: {e}")))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/sessions/{session_id}/history`, with the id percent-encoded.
    pub fn history_url(&self, session_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["sessions", session_id, "history"]);
        }
        url
    }
}

#[async_trait]
impl HistoryStore for HttpHistoryStore {
    async fn fetch(&self, session_id: &str) -> Result<Vec<DrawSegment>> {
        let fetch_err = |e: reqwest::Error| SyncError::HistoryFetch(e.to_string());

        let response = self
            .client
            .get(self.history_url(session_id))
            .send()
            .await
            .map_err(fetch_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let segments = response
            .error_for_status()
            .map_err(fetch_err)?
            .json::<Vec<DrawSegment>>()
            .await
            .map_err(fetch_err)?;
        Ok(segments)
    }

    async fn append(&self, segment: &DrawSegment) -> Result<()> {
        self.client
            .post(self.history_url(&segment.session_id))
            .json(segment)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SyncError::HistoryMutation(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.client
            .delete(self.history_url(session_id))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SyncError::HistoryMutation(e.to_string()))?;
        Ok(())
    }
}
