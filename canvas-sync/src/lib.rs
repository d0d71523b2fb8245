//! # canvas-sync: Real-time shared whiteboard synchronisation
//!
//! Every participant paints its own strokes immediately and broadcasts them
//! as small line segments; remote segments arrive through a publish/subscribe
//! broker and are painted in arrival order. Late joiners replay the session's
//! stored history before going live.
//!
//! ## Architecture
//!
//! ```text
//!   pointer ──► SyncEngine ──► Renderer
//!                 │   ▲
//!         publish │   │ inbound (filtered by session, echo)
//!                 ▼   │
//!              WsTransport ◄──── WebSocket ────► RelayServer
//!                 │                               (topic fan-out)
//!                 ▼
//!            HistoryStore (fetch on join, delete on clear)
//! ```
//!
//! ## Modules
//!
//! - [`event`]: `draw` / `clear` envelopes and their JSON codec
//! - [`frame`]: broker frames wrapping encoded envelopes
//! - [`transport`]: broker connection with fixed-interval reconnect
//! - [`history`]: history store client (HTTP and in-memory)
//! - [`renderer`]: drawing surface abstraction
//! - [`engine`]: per-participant state machine and event loop
//! - [`broadcast`] / [`relay`]: development broker

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod gesture;
pub mod history;
pub mod relay;
pub mod renderer;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{TopicGroup, TopicRegistry, TopicStats};
pub use config::{
    RelayConfig, SyncConfig, DEFAULT_HISTORY_TIMEOUT_MS, DEFAULT_RECONNECT_INTERVAL_MS,
};
pub use engine::{Command, Dispatch, EngineState, SyncEngine, SyncHandle};
pub use error::{Result, SyncError};
pub use event::{ClearBoard, DrawSegment, EventEnvelope, Point, Tool};
pub use frame::Frame;
pub use gesture::{Brush, Gesture};
pub use history::{HistoryStore, HttpHistoryStore, MemoryHistoryStore};
pub use relay::{RelayServer, RelayStats};
pub use renderer::{Paint, Recorder, Renderer};
pub use session::{Participant, Session};
pub use transport::{LinkSettings, Transport, TransportEvent, WsTransport};
