//! Development broker: a topic relay speaking the [`Frame`] protocol.
//!
//! ```text
//! Client A ──send /app/draw──┐
//!                            ├── route ── /topic/whiteboard ── TopicGroup
//! Client B ──subscribe───────┘                                     │
//!                                          ┌───────────────────────┤
//!                                          ▼                       ▼
//!                                       Client A                Client B
//! ```
//!
//! The relay never decodes envelope bodies; `send` bodies are rewrapped as
//! `message` frames on the routed topic and fanned out to every subscriber,
//! the sender included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{TopicGroup, TopicRegistry};
use crate::config::RelayConfig;
use crate::frame::Frame;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_routed: u64,
    pub malformed_frames: u64,
    pub active_topics: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_routed: AtomicU64,
    malformed_frames: AtomicU64,
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: RelayConfig,
    topics: TopicRegistry,
    stats: AtomicRelayStats,
}

/// One topic subscription held by a connection.
struct Subscription {
    forwarder: JoinHandle<()>,
}

pub struct RelayServer {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                topics: TopicRegistry::new(config.topic_capacity),
                config,
                stats: AtomicRelayStats::default(),
            }),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => break,
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared, shutdown).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }

        log::info!("Relay stopped accepting connections");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn stats(&self) -> RelayStats {
        let stats = &self.shared.stats;
        RelayStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            messages_routed: stats.messages_routed.load(Ordering::Relaxed),
            malformed_frames: stats.malformed_frames.load(Ordering::Relaxed),
            active_topics: self.shared.topics.topic_count().await,
        }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.shared.topics
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();

        log::info!("WebSocket connection {conn_id} established from {addr}");
        shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Forwarders push topic frames here; only this task writes the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<str>>(shared.config.topic_capacity.max(1));
        let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_frame(text.as_str(), conn_id, &shared, &out_tx, &mut subscriptions).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },

                    Some(frame) = out_rx.recv() => {
                        ws_sender.send(Message::Text(frame.to_string().into())).await?;
                    }

                    _ = shutdown.changed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (topic, subscription) in subscriptions.drain() {
            Self::release(&shared, conn_id, &topic, subscription).await;
        }
        shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn handle_frame(
        text: &str,
        conn_id: Uuid,
        shared: &Arc<Shared>,
        out_tx: &mpsc::Sender<Arc<str>>,
        subscriptions: &mut HashMap<String, Subscription>,
    ) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                shared.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("Ignoring frame from {conn_id}: {e}");
                return;
            }
        };

        match frame {
            Frame::Subscribe { destination } => {
                if subscriptions.contains_key(&destination) {
                    return;
                }
                let (group, rx) = shared.topics.subscribe(&destination, conn_id).await;
                let forwarder = tokio::spawn(Self::forward(rx, group, out_tx.clone()));
                log::debug!("Connection {conn_id} subscribed to {destination}");
                subscriptions.insert(destination, Subscription { forwarder });
            }

            Frame::Unsubscribe { destination } => {
                if let Some(subscription) = subscriptions.remove(&destination) {
                    Self::release(shared, conn_id, &destination, subscription).await;
                }
            }

            Frame::Send { destination, body } => {
                let topic = shared.config.route(&destination);
                let Some(group) = shared.topics.get(topic).await else {
                    log::trace!("No subscribers on {topic}; dropping send to {destination}");
                    return;
                };
                match Frame::message(topic, body).encode() {
                    Ok(encoded) => {
                        let delivered = group.publish(Arc::from(encoded));
                        shared.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Routed {destination} → {topic} to {delivered} subscribers");
                    }
                    Err(e) => log::error!("Failed to encode message for {topic}: {e}"),
                }
            }

            Frame::Message { destination, .. } => {
                log::warn!("Connection {conn_id} sent a broker-only frame for {destination}");
            }
        }
    }

    /// Copy topic frames into a connection's outbox until either side closes.
    async fn forward(
        mut rx: broadcast::Receiver<Arc<str>>,
        group: Arc<TopicGroup>,
        out_tx: mpsc::Sender<Arc<str>>,
    ) {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    group.record_dropped(n);
                    log::warn!("Subscriber lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn release(shared: &Shared, conn_id: Uuid, topic: &str, subscription: Subscription) {
        subscription.forwarder.abort();
        shared.topics.unsubscribe(topic, &conn_id).await;
        log::debug!("Connection {conn_id} unsubscribed from {topic}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn started() -> (Arc<RelayServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let relay = Arc::new(RelayServer::with_defaults());
        let serving = relay.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (relay, url)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return text.to_string(),
                Ok(Some(Ok(_))) => continue,
                other => panic!("Expected text frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_relay_defaults() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_send_is_routed_to_all_subscribers() {
        let (relay, url) = started().await;
        let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        for ws in [&mut a, &mut b] {
            let sub = Frame::subscribe("/topic/whiteboard").encode().unwrap();
            ws.send(Message::Text(sub.into())).await.unwrap();
        }
        // Let both subscriptions land before publishing
        for _ in 0..50 {
            if let Some(group) = relay.topics().get("/topic/whiteboard").await {
                if group.subscriber_count().await == 2 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let send = Frame::send("/app/draw", "payload").encode().unwrap();
        a.send(Message::Text(send.into())).await.unwrap();

        let expected = Frame::message("/topic/whiteboard", "payload");
        assert_eq!(Frame::decode(&next_text(&mut a).await).unwrap(), expected);
        assert_eq!(Frame::decode(&next_text(&mut b).await).unwrap(), expected);

        let stats = relay.stats().await;
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.active_topics, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_counted_and_ignored() {
        let (relay, url) = started().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        ws.send(Message::Text("garbage".to_string().into())).await.unwrap();
        ws.send(Message::Ping(vec![1u8].into())).await.unwrap();

        // The connection stays usable after a bad frame
        loop {
            match timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Pong(_)))) => break,
                Ok(Some(Ok(_))) => continue,
                other => panic!("Expected pong, got {other:?}"),
            }
        }
        assert_eq!(relay.stats().await.malformed_frames, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_topic_removed_when_last_subscriber_leaves() {
        let (relay, url) = started().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let sub = Frame::subscribe("/topic/whiteboard").encode().unwrap();
        ws.send(Message::Text(sub.into())).await.unwrap();

        for _ in 0..50 {
            if relay.topics().topic_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.topics().topic_count().await, 1);

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if relay.stats().await.active_connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = relay.stats().await;
        assert_eq!(stats.active_topics, 0);
        assert_eq!(stats.total_connections, 1);
        relay.shutdown();
    }
}
