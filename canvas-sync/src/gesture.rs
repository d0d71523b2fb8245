//! Pointer gesture tracking.
//!
//! A gesture starts on pointer-down, emits one segment per pointer-move
//! (previous anchor to new position), and ends on pointer-up or when the
//! pointer leaves the surface. Releasing produces no segment.

use crate::event::{Point, Tool};

/// Local drawing style, owned by the toolbar and read when a segment is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Brush {
    pub color: String,
    pub line_width: f64,
    pub tool: Tool,
}

impl Default for Brush {
    fn default() -> Self {
        Self {
            color: "#000000".to_string(),
            line_width: 2.0,
            tool: Tool::Draw,
        }
    }
}

impl Brush {
    pub fn new(color: impl Into<String>, line_width: f64, tool: Tool) -> Self {
        Self {
            color: color.into(),
            line_width,
            tool,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.line_width.is_finite() && self.line_width > 0.0
    }
}

/// Last-position anchor of the gesture in progress.
#[derive(Debug, Clone, Default)]
pub struct Gesture {
    anchor: Option<Point>,
}

impl Gesture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pointer-down: reset the anchor.
    pub fn press(&mut self, at: Point) {
        self.anchor = Some(at);
    }

    /// Pointer-move: returns `(start, end)` and advances the anchor, or `None`
    /// when no gesture is active.
    pub fn advance(&mut self, to: Point) -> Option<(Point, Point)> {
        let from = self.anchor?;
        self.anchor = Some(to);
        Some((from, to))
    }

    /// Pointer-up or pointer-leave.
    pub fn release(&mut self) {
        self.anchor = None;
    }

    pub fn is_active(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn anchor(&self) -> Option<Point> {
        self.anchor
    }
}
