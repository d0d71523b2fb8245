//! Sync engine: one participant's view of a shared canvas.
//!
//! ```text
//!  Initializing ─► HistoryLoading ─► Live ◄──► Disconnected
//!                                     │             │
//!                                     └──► Terminated ◄┘
//! ```
//!
//! Two producers feed one renderer. Local pointer gestures are painted
//! immediately and then published; inbound envelopes from the transport are
//! filtered (session, echo) and painted. Both run on the engine's single task,
//! so the renderer is never shared. Network waits (history fetch, history
//! delete) run on spawned tasks whose results come back as messages.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::event::{ClearBoard, DrawSegment, EventEnvelope, Point};
use crate::gesture::{Brush, Gesture};
use crate::history::{HistoryStore, HttpHistoryStore, MemoryHistoryStore};
use crate::renderer::Renderer;
use crate::session::{Participant, Session};
use crate::transport::{Transport, TransportEvent, WsTransport};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    HistoryLoading,
    Live,
    Disconnected,
    Terminated,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Remote segment painted
    Painted,
    /// Remote clear applied
    Cleared,
    /// Our own event came back; dropped
    Echo,
    /// Event for another session; dropped
    ForeignSession,
    /// Held until history replay finishes
    Deferred,
    /// Could not be decoded; dropped
    Malformed,
    /// Engine terminated; dropped
    Ignored,
}

/// Requests from the UI layer, applied in order by the engine task.
#[derive(Debug)]
pub enum Command {
    PointerDown(Point),
    PointerMove(Point),
    PointerUp,
    PointerLeave,
    SetBrush(Brush),
    /// Wipe locally, broadcast, and drop stored history. The reply carries the
    /// history store's outcome.
    Clear(oneshot::Sender<Result<()>>),
    State(oneshot::Sender<EngineState>),
    Shutdown,
}

pub struct SyncEngine<R, T> {
    config: SyncConfig,
    session: Session,
    participant: Participant,
    renderer: R,
    transport: T,
    history: Arc<dyn HistoryStore>,
    state: EngineState,
    /// Last link status reported by the transport
    link_up: bool,
    brush: Brush,
    gesture: Gesture,
    /// Inbound envelopes that arrived during history replay
    deferred: Vec<EventEnvelope>,
    /// Set by a local clear before history arrived; the fetch result is stale
    history_superseded: bool,
    /// Ordered stroke persistence (only with `persist_strokes`)
    persister: Option<mpsc::UnboundedSender<DrawSegment>>,
    inbound_tx: mpsc::Sender<TransportEvent>,
    inbound_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl<R: Renderer> SyncEngine<R, WsTransport> {
    /// Engine over a WebSocket transport. The history store is the HTTP one
    /// when `history_url` is set, otherwise an empty in-memory store.
    pub fn from_config(config: SyncConfig, renderer: R) -> Result<Self> {
        let history: Arc<dyn HistoryStore> = match config.history_url.as_deref() {
            Some(url) => Arc::new(HttpHistoryStore::with_timeout(url, config.history_timeout())?),
            None => Arc::new(MemoryHistoryStore::new()),
        };
        let transport = WsTransport::from_config(&config);
        Ok(Self::new(config, renderer, transport, history))
    }
}

impl<R: Renderer, T: Transport> SyncEngine<R, T> {
    pub fn new(config: SyncConfig, renderer: R, transport: T, history: Arc<dyn HistoryStore>) -> Self {
        Self::with_participant(config, Participant::new(), renderer, transport, history)
    }

    /// Create with an explicit participant (for testing)
    pub fn with_participant(
        config: SyncConfig,
        participant: Participant,
        mut renderer: R,
        transport: T,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        renderer.prepare();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        log::info!(
            "Participant {} initialising for session {}",
            participant.user_id,
            config.session_id
        );
        Self {
            session: Session::new(config.session_id.clone()),
            config,
            participant,
            renderer,
            transport,
            history,
            state: EngineState::Initializing,
            link_up: false,
            brush: Brush::default(),
            gesture: Gesture::new(),
            deferred: Vec::new(),
            history_superseded: false,
            persister: None,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn user_id(&self) -> &str {
        &self.participant.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn brush(&self) -> &Brush {
        &self.brush
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sender the transport delivers on. Exposed so a driver that does not
    /// use [`run`](Self::run) can inject events.
    pub fn inbound_sender(&self) -> mpsc::Sender<TransportEvent> {
        self.inbound_tx.clone()
    }

    /// Take the inbound receiver (can only be called once; `run` takes it).
    pub fn take_inbound_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inbound_rx.take()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Enter `HistoryLoading` and activate the transport. Inbound envelopes
    /// are held until [`complete_history_load`](Self::complete_history_load).
    pub fn begin_history_load(&mut self) {
        if self.state != EngineState::Initializing {
            return;
        }
        self.state = EngineState::HistoryLoading;
        if self.config.persist_strokes {
            self.persister = self.start_persister();
        }
        self.transport.connect(self.inbound_tx.clone());
        log::info!("Loading history for session {}", self.session.session_id);
    }

    /// Replay fetched history, flush deferred inbound events, and go live.
    /// A failed fetch degrades to an empty canvas. Results arriving after the
    /// engine left `HistoryLoading` are ignored.
    pub fn complete_history_load(&mut self, result: Result<Vec<DrawSegment>>) {
        if self.state != EngineState::HistoryLoading {
            log::debug!("Ignoring history result in state {:?}", self.state);
            return;
        }

        match result {
            Ok(_) if self.history_superseded => {
                log::debug!(
                    "Board cleared during loading; not replaying history for session {}",
                    self.session.session_id
                );
            }
            Ok(segments) => {
                let painted = self.replay(&segments);
                log::info!(
                    "Replayed {painted} segments for session {}",
                    self.session.session_id
                );
            }
            Err(e) => {
                log::warn!("{e}; starting session {} with an empty canvas", self.session.session_id);
            }
        }

        self.state = if self.link_up {
            EngineState::Live
        } else {
            EngineState::Disconnected
        };

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            log::debug!("Dispatching {} events held during replay", deferred.len());
        }
        for envelope in deferred {
            self.dispatch(envelope);
        }
    }

    /// Paint history segments in order. Never publishes.
    pub fn replay(&mut self, segments: &[DrawSegment]) -> usize {
        let mut painted = 0;
        for segment in segments {
            if !self.session.owns(&segment.session_id) {
                log::debug!("Skipping history entry from session {}", segment.session_id);
                continue;
            }
            if let Err(e) = segment.validate() {
                log::warn!("Skipping history entry from {}: {e}", segment.user_id);
                continue;
            }
            self.renderer.draw_segment(segment);
            painted += 1;
        }
        painted
    }

    /// Release the transport and stop dispatching. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == EngineState::Terminated {
            return;
        }
        self.state = EngineState::Terminated;
        self.transport.disconnect();
        self.renderer.detach();
        self.gesture.release();
        self.deferred.clear();
        self.persister.take();
        log::info!(
            "Participant {} left session {}",
            self.participant.user_id,
            self.session.session_id
        );
    }

    // ── Outbound ────────────────────────────────────────────────

    pub fn pointer_down(&mut self, at: Point) {
        if self.state != EngineState::Terminated {
            self.gesture.press(at);
        }
    }

    /// Build, paint, and publish the segment from the anchor to `at`.
    pub fn pointer_move(&mut self, at: Point) -> Option<DrawSegment> {
        if self.state == EngineState::Terminated {
            return None;
        }
        let (start, end) = self.gesture.advance(at)?;
        let segment = DrawSegment {
            session_id: self.session.session_id.clone(),
            user_id: self.participant.user_id.clone(),
            start_x: start.x,
            start_y: start.y,
            end_x: end.x,
            end_y: end.y,
            color: self.brush.color.clone(),
            line_width: self.brush.line_width,
            tool: self.brush.tool,
        };

        self.renderer.draw_segment(&segment);
        self.transport.publish(&EventEnvelope::Draw(segment.clone()));
        if let Some(persister) = &self.persister {
            if persister.send(segment.clone()).is_err() {
                log::warn!("Stroke persistence stopped; segment not stored");
            }
        }
        Some(segment)
    }

    pub fn pointer_up(&mut self) {
        self.gesture.release();
    }

    pub fn pointer_leave(&mut self) {
        self.gesture.release();
    }

    /// Returns false (and keeps the current brush) if `brush` is unusable.
    pub fn set_brush(&mut self, brush: Brush) -> bool {
        if !brush.is_valid() {
            log::warn!("Rejecting brush with line width {}", brush.line_width);
            return false;
        }
        self.brush = brush;
        true
    }

    /// Wipe locally and broadcast. Stored history is left to the caller.
    /// During loading the wipe also discards held events and the pending
    /// history result, since both predate it.
    pub fn clear_board(&mut self) -> Option<ClearBoard> {
        match self.state {
            EngineState::Terminated => return None,
            EngineState::Initializing | EngineState::HistoryLoading => {
                self.deferred.clear();
                self.history_superseded = true;
            }
            EngineState::Live | EngineState::Disconnected => {}
        }
        let clear = ClearBoard {
            session_id: self.session.session_id.clone(),
            user_id: self.participant.user_id.clone(),
        };
        self.renderer.clear();
        self.transport.publish(&EventEnvelope::Clear(clear.clone()));
        Some(clear)
    }

    /// Wipe locally, broadcast, then drop stored history. A history failure
    /// is returned but the first two effects stay applied.
    pub async fn clear(&mut self) -> Result<()> {
        if self.clear_board().is_none() {
            return Err(SyncError::EngineStopped);
        }
        let result = self.history.clear(&self.session.session_id).await;
        if let Err(e) = &result {
            log::warn!("Board cleared but stored history kept: {e}");
        }
        result
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Apply a transport event. Returns the dispatch outcome for messages.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<Dispatch> {
        match event {
            TransportEvent::Connected => {
                self.link_up = true;
                if self.state == EngineState::Disconnected {
                    self.state = EngineState::Live;
                    log::info!("Session {} live", self.session.session_id);
                }
                None
            }
            TransportEvent::Disconnected => {
                self.link_up = false;
                if self.state == EngineState::Live {
                    self.state = EngineState::Disconnected;
                    log::warn!(
                        "Session {} disconnected; drawing locally until the broker returns",
                        self.session.session_id
                    );
                }
                None
            }
            TransportEvent::Message(body) => Some(self.receive(&body)),
        }
    }

    /// Decode one wire message and dispatch it. Malformed input is dropped.
    pub fn receive(&mut self, body: &str) -> Dispatch {
        if self.state == EngineState::Terminated {
            return Dispatch::Ignored;
        }
        match EventEnvelope::decode(body) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => {
                log::warn!("Dropping inbound message: {e}");
                Dispatch::Malformed
            }
        }
    }

    /// Filter by session and origin, then paint or wipe.
    pub fn dispatch(&mut self, envelope: EventEnvelope) -> Dispatch {
        if self.state == EngineState::Terminated {
            return Dispatch::Ignored;
        }
        if !self.session.owns(envelope.session_id()) {
            log::trace!("Dropping {} for session {}", envelope.kind(), envelope.session_id());
            return Dispatch::ForeignSession;
        }
        if self.participant.originated(envelope.user_id()) {
            log::trace!("Dropping echo of own {}", envelope.kind());
            return Dispatch::Echo;
        }
        if matches!(self.state, EngineState::Initializing | EngineState::HistoryLoading) {
            self.deferred.push(envelope);
            return Dispatch::Deferred;
        }

        match envelope {
            EventEnvelope::Draw(segment) => {
                self.renderer.draw_segment(&segment);
                Dispatch::Painted
            }
            EventEnvelope::Clear(clear) => {
                log::debug!("Board cleared by {}", clear.user_id);
                self.renderer.clear();
                Dispatch::Cleared
            }
        }
    }

    // ── Event loop ──────────────────────────────────────────────

    fn apply(&mut self, command: Command) {
        match command {
            Command::PointerDown(at) => self.pointer_down(at),
            Command::PointerMove(at) => {
                self.pointer_move(at);
            }
            Command::PointerUp => self.pointer_up(),
            Command::PointerLeave => self.pointer_leave(),
            Command::SetBrush(brush) => {
                self.set_brush(brush);
            }
            Command::Clear(reply) => {
                if self.clear_board().is_none() {
                    let _ = reply.send(Err(SyncError::EngineStopped));
                    return;
                }
                let history = self.history.clone();
                let session_id = self.session.session_id.clone();
                tokio::spawn(async move {
                    let result = history.clear(&session_id).await;
                    if let Err(e) = &result {
                        log::warn!("Board cleared but stored history kept: {e}");
                    }
                    let _ = reply.send(result);
                });
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn start_persister(&self) -> Option<mpsc::UnboundedSender<DrawSegment>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("No async runtime; local strokes will not be persisted");
                return None;
            }
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<DrawSegment>();
        let history = self.history.clone();
        runtime.spawn(async move {
            while let Some(segment) = rx.recv().await {
                if let Err(e) = history.append(&segment).await {
                    log::warn!("Segment not persisted: {e}");
                }
            }
        });
        Some(tx)
    }

    /// Drive the engine until shutdown or until every handle is dropped.
    /// Returns the terminated engine.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Self {
        let Some(mut inbound) = self.inbound_rx.take() else {
            log::error!("Sync engine already running");
            return self;
        };

        self.begin_history_load();
        let history = self.history.clone();
        let session_id = self.session.session_id.clone();
        let limit = self.config.history_timeout();
        // Not aborted on shutdown; a late result is ignored.
        let mut fetch = tokio::spawn(async move {
            match tokio::time::timeout(limit, history.fetch(&session_id)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::HistoryFetch(format!(
                    "no answer within {} ms",
                    limit.as_millis()
                ))),
            }
        });
        let mut fetched = false;

        loop {
            tokio::select! {
                joined = &mut fetch, if !fetched => {
                    fetched = true;
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => Err(SyncError::HistoryFetch(e.to_string())),
                    };
                    self.complete_history_load(result);
                }

                Some(event) = inbound.recv() => {
                    self.handle_transport_event(event);
                }

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },
            }
        }

        self.shutdown();
        self
    }
}

impl<R, T> SyncEngine<R, T>
where
    R: Renderer + Send + 'static,
    T: Transport + 'static,
{
    /// Run the engine on its own task.
    pub fn spawn(self) -> (SyncHandle, JoinHandle<Self>) {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let handle = SyncHandle {
            commands: tx,
            user_id: self.participant.user_id.clone(),
            session_id: self.session.session_id.clone(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }
}

/// Cloneable handle for the UI layer.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    user_id: String,
    session_id: String,
}

impl SyncHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    pub async fn pointer_down(&self, x: f64, y: f64) -> Result<()> {
        self.send(Command::PointerDown(Point::new(x, y))).await
    }

    pub async fn pointer_move(&self, x: f64, y: f64) -> Result<()> {
        self.send(Command::PointerMove(Point::new(x, y))).await
    }

    pub async fn pointer_up(&self) -> Result<()> {
        self.send(Command::PointerUp).await
    }

    pub async fn pointer_leave(&self) -> Result<()> {
        self.send(Command::PointerLeave).await
    }

    pub async fn set_brush(&self, brush: Brush) -> Result<()> {
        self.send(Command::SetBrush(brush)).await
    }

    /// Resolves once the history store answered the delete request.
    pub async fn clear(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Clear(tx)).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn state(&self) -> Result<EngineState> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx)).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tool;
    use crate::renderer::{Paint, Recorder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-process transport that records what would hit the broker.
    #[derive(Clone, Default)]
    struct MockTransport {
        published: Arc<Mutex<Vec<EventEnvelope>>>,
        connected: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    impl MockTransport {
        fn published(&self) -> Vec<EventEnvelope> {
            self.published.lock().unwrap().clone()
        }

        fn set_connected(&self, up: bool) {
            self.connected.store(up, Ordering::SeqCst);
        }
    }

    impl Transport for MockTransport {
        fn connect(&mut self, events: mpsc::Sender<TransportEvent>) {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            let _ = events.try_send(TransportEvent::Connected);
        }

        fn publish(&self, envelope: &EventEnvelope) {
            if self.connected.load(Ordering::SeqCst) {
                self.published.lock().unwrap().push(envelope.clone());
            }
        }

        fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// History store that is always unreachable.
    struct FailingStore;

    #[async_trait]
    impl HistoryStore for FailingStore {
        async fn fetch(&self, _: &str) -> Result<Vec<DrawSegment>> {
            Err(SyncError::HistoryFetch("connection refused".into()))
        }
        async fn append(&self, _: &DrawSegment) -> Result<()> {
            Err(SyncError::HistoryMutation("connection refused".into()))
        }
        async fn clear(&self, _: &str) -> Result<()> {
            Err(SyncError::HistoryMutation("connection refused".into()))
        }
    }

    /// History store that accepts the request and never answers.
    struct StalledStore;

    #[async_trait]
    impl HistoryStore for StalledStore {
        async fn fetch(&self, _: &str) -> Result<Vec<DrawSegment>> {
            std::future::pending().await
        }
        async fn append(&self, _: &DrawSegment) -> Result<()> {
            std::future::pending().await
        }
        async fn clear(&self, _: &str) -> Result<()> {
            std::future::pending().await
        }
    }

    type TestEngine = SyncEngine<Recorder, MockTransport>;

    fn engine_with(user: &str, history: Arc<dyn HistoryStore>) -> (TestEngine, Recorder, MockTransport) {
        let recorder = Recorder::new();
        let transport = MockTransport::default();
        let engine = SyncEngine::with_participant(
            SyncConfig::new("s1", "ws://unused"),
            Participant::with_id(user),
            recorder.clone(),
            transport.clone(),
            history,
        );
        (engine, recorder, transport)
    }

    /// Engine that finished an empty history load with the link up.
    fn live_engine(user: &str) -> (TestEngine, Recorder, MockTransport) {
        let (mut engine, recorder, transport) = engine_with(user, Arc::new(MemoryHistoryStore::new()));
        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        engine.complete_history_load(Ok(Vec::new()));
        assert_eq!(engine.state(), EngineState::Live);
        (engine, recorder, transport)
    }

    fn seg(session: &str, user: &str, x: f64) -> DrawSegment {
        DrawSegment {
            session_id: session.into(),
            user_id: user.into(),
            start_x: x,
            start_y: x,
            end_x: x + 1.0,
            end_y: x + 1.0,
            color: "#000000".into(),
            line_width: 4.0,
            tool: Tool::Draw,
        }
    }

    fn body(envelope: &EventEnvelope) -> String {
        envelope.encode().unwrap()
    }

    #[test]
    fn test_initial_state() {
        let (engine, recorder, transport) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        assert_eq!(engine.state(), EngineState::Initializing);
        assert_eq!(engine.user_id(), "u1");
        assert_eq!(engine.session_id(), "s1");
        assert!(recorder.is_prepared());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_echo_is_never_painted() {
        let (mut engine, recorder, _) = live_engine("u1");
        let own = EventEnvelope::Draw(seg("s1", "u1", 0.0));
        let own_clear = EventEnvelope::Clear(ClearBoard {
            session_id: "s1".into(),
            user_id: "u1".into(),
        });

        assert_eq!(engine.receive(&body(&own)), Dispatch::Echo);
        assert_eq!(engine.receive(&body(&own_clear)), Dispatch::Echo);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_foreign_session_is_dropped() {
        let (mut engine, recorder, _) = live_engine("u1");
        let other = EventEnvelope::Draw(seg("s2", "u2", 0.0));
        assert_eq!(engine.dispatch(other), Dispatch::ForeignSession);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_remote_draw_and_clear_are_applied() {
        let (mut engine, recorder, _) = live_engine("u1");
        let remote = seg("s1", "u2", 3.0);
        assert_eq!(engine.dispatch(remote.clone().into()), Dispatch::Painted);
        let clear = ClearBoard {
            session_id: "s1".into(),
            user_id: "u2".into(),
        };
        assert_eq!(engine.dispatch(clear.into()), Dispatch::Cleared);
        assert_eq!(recorder.paints(), vec![Paint::Segment(remote), Paint::Clear]);
    }

    #[test]
    fn test_malformed_message_leaves_state_unchanged() {
        let (mut engine, recorder, transport) = live_engine("u1");
        engine.pointer_down(Point::new(1.0, 1.0));
        let before_state = engine.state();
        let before_anchor = engine.gesture.anchor();

        let unknown = r#"{"type":"rotate","sessionId":"s1","userId":"u2"}"#;
        assert_eq!(engine.receive(unknown), Dispatch::Malformed);
        assert_eq!(engine.receive("{"), Dispatch::Malformed);

        assert_eq!(engine.state(), before_state);
        assert_eq!(engine.gesture.anchor(), before_anchor);
        assert!(recorder.is_empty());
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_gesture_segments_chain_and_publish() {
        let (mut engine, recorder, transport) = live_engine("u1");
        engine.set_brush(Brush::new("#ff0000", 6.0, Tool::Draw));

        engine.pointer_down(Point::new(0.0, 0.0));
        for i in 1..=5 {
            engine.pointer_move(Point::new(i as f64 * 2.0, i as f64));
        }
        engine.pointer_up();
        assert!(engine.pointer_move(Point::new(99.0, 99.0)).is_none());

        let published: Vec<DrawSegment> = transport
            .published()
            .into_iter()
            .map(|env| match env {
                EventEnvelope::Draw(segment) => segment,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(published.len(), 5);
        assert_eq!(published[0].start(), Point::new(0.0, 0.0));
        for pair in published.windows(2) {
            assert_eq!(pair[1].start(), pair[0].end());
        }
        assert!(published.iter().all(|s| s.user_id == "u1" && s.session_id == "s1"));
        assert!(published.iter().all(|s| s.color == "#ff0000" && s.line_width == 6.0));

        // Optimistic local paint matches what was published.
        assert_eq!(recorder.visible(), published);
    }

    #[test]
    fn test_pointer_leave_ends_gesture() {
        let (mut engine, _, transport) = live_engine("u1");
        engine.pointer_down(Point::new(0.0, 0.0));
        engine.pointer_move(Point::new(1.0, 1.0));
        engine.pointer_leave();
        engine.pointer_move(Point::new(2.0, 2.0));
        assert_eq!(transport.published().len(), 1);
    }

    #[test]
    fn test_disconnected_draws_locally_without_publishing() {
        let (mut engine, recorder, transport) = live_engine("u1");
        transport.set_connected(false);
        engine.handle_transport_event(TransportEvent::Disconnected);
        assert_eq!(engine.state(), EngineState::Disconnected);

        engine.pointer_down(Point::new(0.0, 0.0));
        engine.pointer_move(Point::new(5.0, 5.0));
        engine.clear_board();

        assert_eq!(recorder.len(), 2);
        assert!(transport.published().is_empty());

        transport.set_connected(true);
        engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(engine.state(), EngineState::Live);
    }

    #[test]
    fn test_replay_is_idempotent_and_silent() {
        let history = vec![seg("s1", "u2", 0.0), seg("s1", "u3", 1.0), seg("s1", "u1", 2.0)];

        let (mut engine, recorder, transport) = live_engine("u1");
        assert_eq!(engine.replay(&history), 3);
        let first = recorder.paints();
        let (mut fresh, fresh_recorder, _) = live_engine("u1");
        fresh.replay(&history);
        fresh.replay(&history);

        let expected: Vec<Paint> = history.iter().cloned().map(Paint::Segment).collect();
        assert_eq!(first, expected);
        let twice = fresh_recorder.paints();
        assert_eq!(&twice[..3], &expected[..]);
        assert_eq!(&twice[3..], &expected[..]);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_late_joiner_replays_in_order_before_live() {
        let s1 = seg("s1", "u1", 0.0);
        let s2 = seg("s1", "u2", 10.0);
        let (mut engine, recorder, transport) = engine_with("u3", Arc::new(MemoryHistoryStore::new()));

        engine.begin_history_load();
        assert_eq!(engine.state(), EngineState::HistoryLoading);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(engine.state(), EngineState::HistoryLoading);

        engine.complete_history_load(Ok(vec![s1.clone(), s2.clone()]));
        assert_eq!(recorder.paints(), vec![Paint::Segment(s1), Paint::Segment(s2)]);
        assert_eq!(engine.state(), EngineState::Live);
    }

    #[test]
    fn test_inbound_during_replay_is_deferred() {
        let history_seg = seg("s1", "u2", 0.0);
        let live_seg = seg("s1", "u2", 50.0);
        let (mut engine, recorder, _) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));

        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        let outcome = engine
            .handle_transport_event(TransportEvent::Message(body(&live_seg.clone().into())));
        assert_eq!(outcome, Some(Dispatch::Deferred));
        assert!(recorder.is_empty());

        engine.complete_history_load(Ok(vec![history_seg.clone()]));
        assert_eq!(
            recorder.paints(),
            vec![Paint::Segment(history_seg), Paint::Segment(live_seg)]
        );
    }

    #[test]
    fn test_clear_during_loading_discards_held_events_and_history() {
        let stored = seg("s1", "u2", 0.0);
        let early = seg("s1", "u2", 50.0);
        let late = seg("s1", "u3", 80.0);
        let (mut engine, recorder, transport) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));

        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(engine.dispatch(early.into()), Dispatch::Deferred);
        assert!(engine.clear_board().is_some());
        assert_eq!(engine.dispatch(late.clone().into()), Dispatch::Deferred);

        engine.complete_history_load(Ok(vec![stored]));

        assert_eq!(engine.state(), EngineState::Live);
        assert_eq!(recorder.paints(), vec![Paint::Clear, Paint::Segment(late.clone())]);
        assert_eq!(recorder.visible(), vec![late]);
        assert_eq!(transport.published().len(), 1);
    }

    #[test]
    fn test_clear_during_failed_load_still_goes_live() {
        let (mut engine, recorder, _) = engine_with("u1", Arc::new(FailingStore));
        engine.begin_history_load();
        engine.clear_board();
        engine.complete_history_load(Err(SyncError::HistoryFetch("refused".into())));
        assert_eq!(engine.state(), EngineState::Disconnected);
        assert_eq!(recorder.paints(), vec![Paint::Clear]);
    }

    #[test]
    fn test_shutdown_during_loading_drops_held_events() {
        let (mut engine, recorder, _) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(engine.dispatch(seg("s1", "u2", 5.0).into()), Dispatch::Deferred);

        engine.shutdown();
        engine.complete_history_load(Ok(vec![seg("s1", "u2", 0.0)]));

        assert_eq!(engine.state(), EngineState::Terminated);
        assert!(engine.deferred.is_empty());
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_replay_skips_invalid_entries() {
        let good = seg("s1", "u2", 1.0);
        let mut nan = seg("s1", "u2", 2.0);
        nan.end_x = f64::NAN;
        let mut flat = seg("s1", "u2", 3.0);
        flat.line_width = 0.0;

        let (mut engine, recorder, _) = live_engine("u1");
        assert_eq!(engine.replay(&[nan, good.clone(), flat]), 1);
        assert_eq!(recorder.paints(), vec![Paint::Segment(good)]);
    }

    #[test]
    fn test_local_drawing_during_replay_is_painted() {
        let (mut engine, recorder, _) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        engine.begin_history_load();
        engine.pointer_down(Point::new(0.0, 0.0));
        let local = engine.pointer_move(Point::new(1.0, 1.0)).unwrap();
        assert_eq!(recorder.paints(), vec![Paint::Segment(local)]);
    }

    #[test]
    fn test_history_failure_degrades_to_empty_canvas() {
        let (mut engine, recorder, _) = engine_with("u1", Arc::new(FailingStore));
        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        engine.complete_history_load(Err(SyncError::HistoryFetch("timeout".into())));
        assert_eq!(engine.state(), EngineState::Live);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_history_without_link_enters_disconnected() {
        let (mut engine, _, _) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        engine.begin_history_load();
        engine.complete_history_load(Ok(Vec::new()));
        assert_eq!(engine.state(), EngineState::Disconnected);
        engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(engine.state(), EngineState::Live);
    }

    #[test]
    fn test_late_history_after_shutdown_is_ignored() {
        let (mut engine, recorder, transport) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        engine.begin_history_load();
        engine.shutdown();
        engine.complete_history_load(Ok(vec![seg("s1", "u2", 0.0)]));

        assert_eq!(engine.state(), EngineState::Terminated);
        assert!(recorder.is_empty());
        assert!(recorder.is_detached());
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

        engine.shutdown();
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.dispatch(seg("s1", "u2", 1.0).into()), Dispatch::Ignored);
    }

    #[test]
    fn test_invalid_brush_rejected() {
        let (mut engine, _, _) = live_engine("u1");
        assert!(!engine.set_brush(Brush::new("#fff", -1.0, Tool::Draw)));
        assert_eq!(engine.brush(), &Brush::default());
        assert!(engine.set_brush(Brush::new("#fff", 20.0, Tool::Erase)));
        assert_eq!(engine.brush().tool, Tool::Erase);
    }

    #[tokio::test]
    async fn test_clear_wipes_publishes_and_drops_history() {
        let store = Arc::new(MemoryHistoryStore::with_history("s1", vec![seg("s1", "u2", 0.0)]));
        let (mut engine, recorder, transport) = engine_with("u1", store.clone());
        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        engine.complete_history_load(store.fetch("s1").await);

        engine.clear().await.unwrap();

        assert_eq!(recorder.paints().last(), Some(&Paint::Clear));
        assert!(recorder.visible().is_empty());
        assert_eq!(
            transport.published(),
            vec![EventEnvelope::Clear(ClearBoard {
                session_id: "s1".into(),
                user_id: "u1".into(),
            })]
        );
        assert_eq!(store.len("s1").await, 0);
    }

    #[tokio::test]
    async fn test_clear_reports_history_failure_without_rollback() {
        let (mut engine, recorder, transport) = engine_with("u1", Arc::new(FailingStore));
        engine.begin_history_load();
        engine.handle_transport_event(TransportEvent::Connected);
        engine.complete_history_load(Ok(Vec::new()));

        let result = engine.clear().await;
        assert!(matches!(result, Err(SyncError::HistoryMutation(_))));
        assert_eq!(recorder.paints(), vec![Paint::Clear]);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_strokes_appends_in_order() {
        let store = Arc::new(MemoryHistoryStore::new());
        let mut config = SyncConfig::new("s1", "ws://unused");
        config.persist_strokes = true;
        let mut engine = SyncEngine::with_participant(
            config,
            Participant::with_id("u1"),
            Recorder::new(),
            MockTransport::default(),
            store.clone(),
        );
        engine.begin_history_load();
        engine.pointer_down(Point::new(0.0, 0.0));
        for i in 1..=10 {
            engine.pointer_move(Point::new(i as f64, 0.0));
        }

        for _ in 0..50 {
            if store.len("s1").await == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stored = store.fetch("s1").await.unwrap();
        let ends: Vec<f64> = stored.iter().map(|s| s.end_x).collect();
        assert_eq!(ends, (1..=10).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dead_persister_does_not_block_drawing() {
        let (mut engine, recorder, transport) = live_engine("u1");
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        engine.persister = Some(tx);

        engine.pointer_down(Point::new(0.0, 0.0));
        let segment = engine.pointer_move(Point::new(3.0, 4.0));

        assert!(segment.is_some());
        assert_eq!(recorder.len(), 1);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_history_times_out_and_goes_live() {
        let config = SyncConfig::new("s1", "ws://unused")
            .with_history_timeout(Duration::from_millis(50));
        let recorder = Recorder::new();
        let engine = SyncEngine::with_participant(
            config,
            Participant::with_id("u1"),
            recorder.clone(),
            MockTransport::default(),
            Arc::new(StalledStore),
        );
        let inbound = engine.inbound_sender();
        let (handle, task) = engine.spawn();

        let remote = seg("s1", "u2", 7.0);
        inbound
            .send(TransportEvent::Message(body(&remote.clone().into())))
            .await
            .unwrap();

        let mut state = handle.state().await.unwrap();
        for _ in 0..100 {
            if state == EngineState::Live {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = handle.state().await.unwrap();
        }
        assert_eq!(state, EngineState::Live);
        assert_eq!(recorder.visible(), vec![remote]);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_engine_round_trip() {
        let store = Arc::new(MemoryHistoryStore::with_history("s1", vec![seg("s1", "u9", 0.0)]));
        let (engine, recorder, transport) = engine_with("u1", store.clone());
        let (handle, task) = engine.spawn();
        assert_eq!(handle.user_id(), "u1");

        let mut state = handle.state().await.unwrap();
        for _ in 0..50 {
            if state == EngineState::Live {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = handle.state().await.unwrap();
        }
        assert_eq!(state, EngineState::Live);
        assert_eq!(recorder.len(), 1);

        handle.pointer_down(0.0, 0.0).await.unwrap();
        handle.pointer_move(10.0, 10.0).await.unwrap();
        handle.pointer_up().await.unwrap();
        handle.clear().await.unwrap();
        assert_eq!(store.len("s1").await, 0);

        handle.shutdown().await.unwrap();
        let engine = task.await.unwrap();
        assert_eq!(engine.state(), EngineState::Terminated);
        assert_eq!(transport.published().len(), 2);
        assert!(!transport.is_connected());
        assert_eq!(recorder.len(), 3);
        assert!(matches!(handle.pointer_down(1.0, 1.0).await, Err(SyncError::EngineStopped)));
    }

    #[tokio::test]
    async fn test_dropping_all_handles_terminates() {
        let (engine, _, transport) = engine_with("u1", Arc::new(MemoryHistoryStore::new()));
        let (handle, task) = engine.spawn();
        drop(handle);
        let engine = task.await.unwrap();
        assert_eq!(engine.state(), EngineState::Terminated);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }
}
