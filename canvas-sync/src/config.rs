//! Client and relay configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Default bound on the join-time history fetch.
pub const DEFAULT_HISTORY_TIMEOUT_MS: u64 = 10_000;

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Session this participant draws in
    pub session_id: String,
    /// Broker WebSocket URL
    pub broker_url: String,
    /// Broadcast topic carrying every session's envelopes
    pub topic: String,
    /// Endpoint that accepts both `draw` and `clear` envelopes
    pub publish_destination: String,
    /// Fixed delay between reconnection attempts, retried indefinitely
    pub reconnect_interval_ms: u64,
    /// Outbox capacity while connected; overflow is dropped
    pub outbound_buffer: usize,
    /// Transport → engine channel capacity
    pub inbound_buffer: usize,
    /// Handle → engine channel capacity
    pub command_buffer: usize,
    /// Append every local segment to the history store
    pub persist_strokes: bool,
    /// Base URL of the HTTP history store (None = caller supplies a store)
    pub history_url: Option<String>,
    /// Longest wait for the join-time history fetch before going live empty
    pub history_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            broker_url: "ws://127.0.0.1:9090".to_string(),
            topic: "/topic/whiteboard".to_string(),
            publish_destination: "/app/draw".to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            outbound_buffer: 256,
            inbound_buffer: 256,
            command_buffer: 256,
            persist_strokes: false,
            history_url: None,
            history_timeout_ms: DEFAULT_HISTORY_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    pub fn new(session_id: impl Into<String>, broker_url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON; absent keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn with_history_timeout(mut self, timeout: Duration) -> Self {
        self.history_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Relay (development broker) configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages buffered per subscriber before it starts lagging
    pub topic_capacity: usize,
    /// Publish destination → topic
    pub routes: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert("/app/draw".to_string(), "/topic/whiteboard".to_string());
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            topic_capacity: 256,
            routes,
        }
    }
}

impl RelayConfig {
    /// Topic a `send` to `destination` is delivered on. Unrouted
    /// destinations are treated as topics themselves.
    pub fn route<'a>(&'a self, destination: &'a str) -> &'a str {
        self.routes
            .get(destination)
            .map(String::as_str)
            .unwrap_or(destination)
    }
}
