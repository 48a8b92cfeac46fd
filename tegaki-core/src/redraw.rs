//! Single-flight redraw scheduling
//!
//! At most one frame is ever requested. Updates that arrive before it fires
//! only grow the dirty region the frame will repaint.

use kurbo::Rect;

#[derive(Debug, Default)]
pub struct RedrawScheduler {
    scheduled: bool,
    dirty: Option<Rect>,
    frames: u64,
}

impl RedrawScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `rect` dirty
    ///
    /// Returns true when the caller must schedule the next frame, which is
    /// only the first request since the last [`RedrawScheduler::take_frame`].
    pub fn request(&mut self, rect: Rect) -> bool {
        let rect = rect.abs();
        self.dirty = Some(match self.dirty {
            Some(dirty) => dirty.union(rect),
            None => rect,
        });
        if self.scheduled {
            false
        } else {
            self.scheduled = true;
            true
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// Dirty region accumulated so far, without consuming it
    pub fn pending(&self) -> Option<Rect> {
        self.dirty
    }

    /// Called from the frame callback: clears the request and hands back the
    /// coalesced dirty region
    pub fn take_frame(&mut self) -> Option<Rect> {
        if !self.scheduled {
            return None;
        }
        self.scheduled = false;
        self.frames += 1;
        self.dirty.take()
    }

    /// Frames delivered so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}
