//! Renderer adapter boundary.
//!
//! Pixel painting lives outside the sync core. The engine owns its renderer
//! exclusively and calls it from a single task, so implementations need no
//! interior locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::DrawSegment;

pub trait Renderer {
    /// Called once before history replay.
    fn prepare(&mut self) {}

    /// Paint one segment (draw or erase, per `segment.tool`).
    fn draw_segment(&mut self, segment: &DrawSegment);

    /// Wipe the whole surface.
    fn clear(&mut self);

    /// Called once on shutdown; release resize and input listeners here.
    fn detach(&mut self) {}
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn prepare(&mut self) {
        (**self).prepare()
    }

    fn draw_segment(&mut self, segment: &DrawSegment) {
        (**self).draw_segment(segment)
    }

    fn clear(&mut self) {
        (**self).clear()
    }

    fn detach(&mut self) {
        (**self).detach()
    }
}

/// A paint call observed by [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub enum Paint {
    Segment(DrawSegment),
    Clear,
}

/// Headless renderer that records every paint call.
///
/// Clones share one log, so a copy kept outside the engine sees what the
/// engine painted.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<Paint>>>,
    prepared: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all paint calls so far.
    pub fn paints(&self) -> Vec<Paint> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Segments painted since the last clear, i.e. what is visible.
    pub fn visible(&self) -> Vec<DrawSegment> {
        let mut visible = Vec::new();
        for paint in self.paints() {
            match paint {
                Paint::Segment(segment) => visible.push(segment),
                Paint::Clear => visible.clear(),
            }
        }
        visible
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Relaxed)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    fn push(&self, paint: Paint) {
        if let Ok(mut log) = self.log.lock() {
            log.push(paint);
        }
    }
}

impl Renderer for Recorder {
    fn prepare(&mut self) {
        self.prepared.store(true, Ordering::Relaxed);
    }

    fn draw_segment(&mut self, segment: &DrawSegment) {
        self.push(Paint::Segment(segment.clone()));
    }

    fn clear(&mut self) {
        self.push(Paint::Clear);
    }

    fn detach(&mut self) {
        self.detached.store(true, Ordering::Relaxed);
    }
}
