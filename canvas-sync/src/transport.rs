//! Transport session: one logical broker connection per process.
//!
//! Lifecycle:
//! ```text
//!   connect() ──► [connecting] ──ok──► [open: subscribed, outbox live]
//!                     ▲   │ err                │ lost
//!                     │   ▼                    ▼
//!                     └─ sleep(retry interval) ◄┘
//!   disconnect() cancels whichever of the three is pending.
//! ```
//!
//! Publishing is best-effort: while the socket is not open there is no
//! outbox and `publish` drops the envelope without error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::EventEnvelope;
use crate::frame::Frame;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket open and topic subscribed
    Connected,
    /// Socket lost; a retry is scheduled unless disconnecting
    Disconnected,
    /// Raw envelope body received on the subscribed topic
    Message(String),
}

/// Broker connection as seen by the sync engine.
pub trait Transport: Send {
    /// Start connecting in the background. Inbound traffic and link changes
    /// are delivered on `events`. Returns immediately.
    fn connect(&mut self, events: mpsc::Sender<TransportEvent>);

    /// Send an envelope on the session channel; a no-op while disconnected.
    fn publish(&self, envelope: &EventEnvelope);

    /// Release the socket and subscription and stop retrying. Idempotent.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Where to connect and what to subscribe/publish to.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub broker_url: String,
    pub topic: String,
    pub publish_destination: String,
    pub retry_interval: Duration,
    pub outbound_buffer: usize,
}

impl From<&SyncConfig> for LinkSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            broker_url: config.broker_url.clone(),
            topic: config.topic.clone(),
            publish_destination: config.publish_destination.clone(),
            retry_interval: config.reconnect_interval(),
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }
}

/// State shared between the transport handle and its supervisor task.
#[derive(Debug, Default)]
struct Link {
    connected: AtomicBool,
    /// Present only while the socket is open.
    outbox: Mutex<Option<mpsc::Sender<String>>>,
}

impl Link {
    fn mark_up(&self, outbox: mpsc::Sender<String>) {
        if let Ok(mut slot) = self.outbox.lock() {
            *slot = Some(outbox);
        }
        self.connected.store(true, Ordering::SeqCst);
    }

    fn mark_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.outbox.lock() {
            slot.take();
        }
    }

    fn offer(&self, body: String) {
        let Ok(slot) = self.outbox.lock() else {
            return;
        };
        let Some(outbox) = slot.as_ref() else {
            log::trace!("Not connected; dropping outbound event");
            return;
        };
        match outbox.try_send(body) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbox full; dropping outbound event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Outbox closed; dropping outbound event");
            }
        }
    }
}

/// Why an open session ended.
enum SessionEnd {
    Lost,
    Cancelled,
}

/// WebSocket transport with fixed-interval reconnection.
pub struct WsTransport {
    settings: LinkSettings,
    link: Arc<Link>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            link: Arc::new(Link::default()),
            shutdown: None,
            task: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(LinkSettings::from(config))
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Whether a supervisor task is still running (connected or retrying).
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Connect, subscribe, run until lost, wait, repeat. Exits on shutdown.
    async fn supervise(
        settings: LinkSettings,
        link: Arc<Link>,
        events: mpsc::Sender<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(settings.broker_url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok((socket, _)) => {
                    log::info!("Connected to broker at {}", settings.broker_url);
                    let end =
                        Self::run_session(socket, &settings, &link, &events, &mut shutdown).await;
                    link.mark_down();
                    let _ = events.send(TransportEvent::Disconnected).await;
                    if let SessionEnd::Cancelled = end {
                        break;
                    }
                    log::warn!("Broker connection lost");
                }
                Err(e) => {
                    let err = SyncError::Connection(e.to_string());
                    log::warn!("{err} ({})", settings.broker_url);
                }
            }

            log::info!(
                "Reconnecting to {} in {}ms",
                settings.broker_url,
                settings.retry_interval.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(settings.retry_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        link.mark_down();
        log::debug!("Transport supervisor for {} stopped", settings.broker_url);
    }

    /// Subscribe, then pump frames both ways until the socket drops or
    /// shutdown is signalled.
    async fn run_session(
        socket: Socket,
        settings: &LinkSettings,
        link: &Link,
        events: &mpsc::Sender<TransportEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut writer, mut reader) = socket.split();

        let subscribe = match Frame::subscribe(settings.topic.as_str()).encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode subscribe frame: {e}");
                return SessionEnd::Lost;
            }
        };
        if let Err(e) = writer.send(Message::Text(subscribe.into())).await {
            log::warn!("Subscribe to {} failed: {e}", settings.topic);
            return SessionEnd::Lost;
        }
        log::info!("Subscribed to {}", settings.topic);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(settings.outbound_buffer);
        link.mark_up(out_tx);
        let _ = events.send(TransportEvent::Connected).await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Ok(text) = Frame::unsubscribe(settings.topic.as_str()).encode() {
                        let _ = writer.send(Message::Text(text.into())).await;
                    }
                    let _ = writer.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }

                Some(body) = out_rx.recv() => {
                    let frame = Frame::send(settings.publish_destination.as_str(), body);
                    match frame.encode() {
                        Ok(text) => {
                            if let Err(e) = writer.send(Message::Text(text.into())).await {
                                log::warn!("Publish failed: {e}");
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => log::error!("Failed to encode send frame: {e}"),
                    }
                }

                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(Frame::Message { destination, body }) if destination == settings.topic => {
                            if events.send(TransportEvent::Message(body)).await.is_err() {
                                // Owner went away; nothing left to deliver to.
                                return SessionEnd::Cancelled;
                            }
                        }
                        Ok(other) => {
                            log::debug!("Ignoring frame for {}", other.destination());
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Err(e)) => {
                        log::warn!("Broker socket error: {e}");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, events: mpsc::Sender<TransportEvent>) {
        if self.is_active() {
            log::debug!("Transport already connecting or connected");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("Cannot connect to {} outside a tokio runtime", self.settings.broker_url);
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(runtime.spawn(Self::supervise(
            self.settings.clone(),
            self.link.clone(),
            events,
            shutdown_rx,
        )));
    }

    fn publish(&self, envelope: &EventEnvelope) {
        match envelope.encode() {
            Ok(body) => self.link.offer(body),
            Err(e) => log::error!("Failed to encode {} envelope: {e}", envelope.kind()),
        }
    }

    fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
            log::info!("Disconnecting from {}", self.settings.broker_url);
        }
        self.task.take();
        self.link.mark_down();
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
