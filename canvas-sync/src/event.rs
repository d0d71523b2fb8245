//! Drawing events and their JSON wire codec.
//!
//! Wire shape (one JSON object per envelope, tagged by `type`):
//! ```text
//! { "type": "draw",  "sessionId", "userId", "startX", "startY",
//!                    "endX", "endY", "color", "lineWidth", "tool" }
//! { "type": "clear", "sessionId", "userId" }
//! ```
//!
//! The discriminator is checked before any other field is interpreted; an
//! absent or unknown `type` decodes to [`SyncError::MalformedEvent`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A position on the canvas surface, in pixels from the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Painting mode of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Draw,
    Erase,
}

/// One straight-line increment of a stroke.
///
/// Coordinates are pixel-literal in the originating canvas; peers with a
/// different canvas size see the same pixel positions, not scaled ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawSegment {
    pub session_id: String,
    pub user_id: String,
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    /// Opaque style token; ignored by renderers when `tool` is `Erase`.
    pub color: String,
    pub line_width: f64,
    #[serde(default)]
    pub tool: Tool,
}

impl DrawSegment {
    pub fn start(&self) -> Point {
        Point::new(self.start_x, self.start_y)
    }

    pub fn end(&self) -> Point {
        Point::new(self.end_x, self.end_y)
    }

    /// Reject segments no renderer could paint.
    pub fn validate(&self) -> Result<()> {
        if !(self.line_width.is_finite() && self.line_width > 0.0) {
            return Err(SyncError::MalformedEvent(format!(
                "lineWidth must be positive, got {}",
                self.line_width
            )));
        }
        let coords = [self.start_x, self.start_y, self.end_x, self.end_y];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(SyncError::MalformedEvent("non-finite coordinate".into()));
        }
        Ok(())
    }
}

/// Instruction to wipe the whole surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearBoard {
    pub session_id: String,
    pub user_id: String,
}

/// Tagged union transmitted for every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventEnvelope {
    #[serde(rename = "draw")]
    Draw(DrawSegment),
    #[serde(rename = "clear")]
    Clear(ClearBoard),
}

impl EventEnvelope {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Draw(segment) => &segment.session_id,
            Self::Clear(clear) => &clear.session_id,
        }
    }

    /// Origin participant. Used for echo suppression only.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Draw(segment) => &segment.user_id,
            Self::Clear(clear) => &clear.user_id,
        }
    }

    /// Wire discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Draw(_) => "draw",
            Self::Clear(_) => "clear",
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SyncError::from)
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(text)?;
        if let Self::Draw(segment) = &envelope {
            segment.validate()?;
        }
        Ok(envelope)
    }
}

impl From<DrawSegment> for EventEnvelope {
    fn from(segment: DrawSegment) -> Self {
        Self::Draw(segment)
    }
}

impl From<ClearBoard> for EventEnvelope {
    fn from(clear: ClearBoard) -> Self {
        Self::Clear(clear)
    }
}
