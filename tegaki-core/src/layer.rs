//! Layer entity for the tegaki core
//!
//! A layer owns its payload (behind an `Arc` so history snapshots and the
//! transform session's staged copy share it until someone writes) and a
//! model matrix placing that payload on the canvas.

use crate::matrix::Matrix;
use crate::payload::{Bakeable, Payload};
use kurbo::Rect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable layer identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u64);

impl LayerId {
    /// Largest id a persisted record may carry; JSON numbers above this
    /// lose precision in most readers
    pub const MAX_PERSISTED: u64 = (1 << 53) - 1;
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source
///
/// Restored ids are fed back through [`LayerIdGenerator::observe`] so that
/// freshly created layers never collide with them.
#[derive(Clone, Debug, Default)]
pub struct LayerIdGenerator {
    next: u64,
}

impl LayerIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> LayerId {
        let id = LayerId(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    /// Raise the high-water mark past `id`
    pub fn observe(&mut self, id: LayerId) {
        if id.0 >= self.next {
            self.next = id.0.saturating_add(1);
        }
    }

    pub fn peek(&self) -> LayerId {
        LayerId(self.next)
    }
}

/// Compositing mode, passed through to the render bridge
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Add,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::Add,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::Add => "Add",
        }
    }
}

/// One drawing surface
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub(crate) id: LayerId,
    pub(crate) name: String,
    pub(crate) visible: bool,
    /// 0.0 to 1.0
    pub(crate) opacity: f64,
    pub(crate) blend_mode: BlendMode,
    pub(crate) payload: Arc<Payload>,
    /// Content shown instead of `payload` while a transform is being dragged
    pub(crate) preview: Option<Arc<Payload>>,
    pub(crate) model_matrix: Matrix,
    pub(crate) is_background: bool,
}

impl Layer {
    /// Create a visible, opaque layer with identity matrix
    pub fn new(id: LayerId, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            name: name.into(),
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            payload: Arc::new(payload),
            preview: None,
            model_matrix: Matrix::IDENTITY,
            is_background: false,
        }
    }

    pub(crate) fn background(id: LayerId, payload: Payload) -> Self {
        Self {
            is_background: true,
            ..Self::new(id, "Background", payload)
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn is_background(&self) -> bool {
        self.is_background
    }

    pub fn model_matrix(&self) -> Matrix {
        self.model_matrix
    }

    /// Committed content
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_arc(&self) -> Arc<Payload> {
        Arc::clone(&self.payload)
    }

    /// Content a renderer should draw under the current model matrix
    pub fn display_payload(&self) -> &Payload {
        self.preview.as_deref().unwrap_or(&self.payload)
    }

    pub fn is_previewing(&self) -> bool {
        self.preview.is_some()
    }

    pub fn local_bounds(&self) -> Rect {
        self.display_payload().local_bounds()
    }

    /// Mutable payload access; copies first if a snapshot shares it
    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        Arc::make_mut(&mut self.payload)
    }

    pub(crate) fn set_payload(&mut self, payload: Arc<Payload>) {
        self.payload = payload;
    }
}
