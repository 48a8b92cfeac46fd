//! Layer store
//!
//! Owns the ordered layer list (index 0 is the bottom) and the active layer.
//! This is the only place a layer's payload or model matrix is written,
//! apart from the transform session's staged preview which goes through the
//! `pub(crate)` hooks below.
//!
//! Invariant: exactly one layer is the background, it sits at index 0 and
//! its model matrix is always identity.

use crate::bridge::RenderBridge;
use crate::config::ResamplePolicy;
use crate::error::{Result, TegakiError};
use crate::layer::{BlendMode, Layer, LayerId, LayerIdGenerator};
use crate::matrix::Matrix;
use crate::payload::{Bakeable, Payload, PayloadKind, StrokePath, StrokeStyle};
use image::{Rgba, RgbaImage};
use kurbo::Rect;
use log::{debug, warn};
use std::sync::Arc;

/// Direction for [`LayerStore::move_layer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerDirection {
    Up,
    Down,
}

#[derive(Clone, Debug)]
pub struct LayerStore {
    width: u32,
    height: u32,
    kind: PayloadKind,
    layers: Vec<Layer>,
    active: usize,
    ids: LayerIdGenerator,
}

impl LayerStore {
    /// New document with a single background layer
    ///
    /// Raster backgrounds start out opaque white.
    pub fn new(width: u32, height: u32, kind: PayloadKind) -> Self {
        let mut ids = LayerIdGenerator::new();
        let background = Layer::background(ids.next_id(), background_payload(kind, width, height));
        Self {
            width,
            height,
            kind,
            layers: vec![background],
            active: 0,
            ids,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width as f64, self.height as f64)
    }

    /// Layers bottom to top
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn get_active_layer(&self) -> Option<&Layer> {
        self.layers.get(self.active)
    }

    pub fn active_id(&self) -> Option<LayerId> {
        self.get_active_layer().map(|l| l.id)
    }

    pub fn background_id(&self) -> LayerId {
        self.layers[0].id
    }

    /// Next id the store will hand out
    pub fn next_id(&self) -> LayerId {
        self.ids.peek()
    }

    pub fn set_active(&mut self, id: LayerId) -> Result<()> {
        let index = self.index_of(id).ok_or(TegakiError::LayerNotFound(id))?;
        self.active = index;
        Ok(())
    }

    /// Insert a blank layer above the active one and make it active
    pub fn create_layer(&mut self, name: impl Into<String>) -> LayerId {
        let layer = Layer::new(
            self.ids.next_id(),
            name,
            Payload::blank(self.kind, self.width, self.height),
        );
        let id = layer.id;
        let index = (self.active + 1).min(self.layers.len());
        self.layers.insert(index, layer);
        self.active = index;
        debug!("Created layer {} at index {}", id, index);
        id
    }

    /// Copy a layer (payload, matrix and flags) into a new layer above it
    pub fn duplicate_layer(&mut self, source: LayerId) -> Result<LayerId> {
        let index = self.index_of(source).ok_or(TegakiError::LayerNotFound(source))?;
        let original = &self.layers[index];
        let copy = Layer {
            id: self.ids.next_id(),
            name: format!("{} copy", original.name),
            visible: original.visible,
            opacity: original.opacity,
            blend_mode: original.blend_mode,
            payload: Arc::clone(&original.payload),
            preview: None,
            model_matrix: original.model_matrix,
            is_background: false,
        };
        let id = copy.id;
        self.layers.insert(index + 1, copy);
        self.active = index + 1;
        debug!("Duplicated layer {} as {}", source, id);
        Ok(id)
    }

    /// Remove a layer
    ///
    /// The background and the last remaining layer cannot be deleted.
    pub fn delete_layer(&mut self, id: LayerId) -> Result<Layer> {
        let index = self.index_of(id).ok_or(TegakiError::LayerNotFound(id))?;
        if self.layers[index].is_background {
            warn!("Refusing to delete background layer {}", id);
            return Err(TegakiError::InvalidTarget("background layer cannot be deleted".to_string()));
        }
        if self.layers.len() <= 1 {
            return Err(TegakiError::InvalidTarget("cannot delete the only layer".to_string()));
        }
        let removed = self.layers.remove(index);
        if self.active > index || self.active >= self.layers.len() {
            self.active = self.active.saturating_sub(1);
        } else if self.active == index {
            self.active = index.saturating_sub(1);
        }
        debug!("Deleted layer {}", id);
        Ok(removed)
    }

    /// Composite a layer onto the one below it
    ///
    /// Both layers' model matrices are baked as part of the merge and the
    /// result has identity matrix. The merged layer is removed and the
    /// destination becomes active. Two vector layers with a normal blend
    /// stay vector; anything else is composited into a raster.
    pub fn merge_down(&mut self, id: LayerId, bridge: &mut dyn RenderBridge) -> Result<LayerId> {
        let index = self.index_of(id).ok_or(TegakiError::LayerNotFound(id))?;
        if index == 0 {
            return Err(TegakiError::InvalidTarget("no layer below to merge into".to_string()));
        }
        let upper = &self.layers[index];
        let lower = &self.layers[index - 1];
        let merged = match (lower.payload.as_ref(), upper.payload.as_ref()) {
            (Payload::Paths(lp), Payload::Paths(up)) if upper.blend_mode == BlendMode::Normal => {
                // Path bakes ignore the resample policy
                let mut result = lp.bake(&lower.model_matrix, ResamplePolicy::Nearest)?;
                let baked_upper = up.bake(&upper.model_matrix, ResamplePolicy::Nearest)?;
                let opacity = upper.opacity;
                result.paths.extend(baked_upper.paths.into_iter().map(|p| StrokePath {
                    style: StrokeStyle {
                        color: fade(p.style.color, opacity),
                        ..p.style
                    },
                    ..p
                }));
                Payload::Paths(result)
            }
            _ => {
                let (w, h) = lower.payload.dimensions();
                let mut surface = RgbaImage::new(w, h);
                let base = Layer {
                    visible: true,
                    opacity: 1.0,
                    blend_mode: BlendMode::Normal,
                    preview: None,
                    ..lower.clone()
                };
                let top = Layer {
                    visible: true,
                    preview: None,
                    ..upper.clone()
                };
                let full = Rect::new(0.0, 0.0, w as f64, h as f64);
                bridge.composite_layers(&[base, top], Matrix::IDENTITY, &mut surface, full)?;
                Payload::Raster(surface)
            }
        };

        let lower = &mut self.layers[index - 1];
        lower.payload = Arc::new(merged);
        lower.model_matrix = Matrix::IDENTITY;
        let lower_id = lower.id;
        self.layers.remove(index);
        self.active = index - 1;
        debug!("Merged layer {} into {}", id, lower_id);
        Ok(lower_id)
    }

    /// Move a layer one step; the background never moves and nothing goes below it
    pub fn move_layer(&mut self, id: LayerId, direction: LayerDirection) -> Result<()> {
        let index = self.index_of(id).ok_or(TegakiError::LayerNotFound(id))?;
        if self.layers[index].is_background {
            return Err(TegakiError::InvalidTarget("background layer cannot be reordered".to_string()));
        }
        let target = match direction {
            LayerDirection::Up if index + 1 < self.layers.len() => index + 1,
            LayerDirection::Down if index > 1 => index - 1,
            _ => return Err(TegakiError::InvalidTarget("layer cannot move further".to_string())),
        };
        let active_id = self.active_id();
        self.layers.swap(index, target);
        if let Some(active_id) = active_id {
            self.active = self.index_of(active_id).unwrap_or(self.active);
        }
        Ok(())
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> Result<()> {
        self.layer_mut(id)?.name = name.into();
        Ok(())
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<()> {
        self.layer_mut(id)?.visible = visible;
        Ok(())
    }

    /// Opacity is clamped to 0.0..=1.0
    pub fn set_opacity(&mut self, id: LayerId, opacity: f64) -> Result<()> {
        let opacity = if opacity.is_finite() { opacity.clamp(0.0, 1.0) } else { 1.0 };
        self.layer_mut(id)?.opacity = opacity;
        Ok(())
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> Result<()> {
        self.layer_mut(id)?.blend_mode = mode;
        Ok(())
    }

    // === MUTATION HOOKS (pub(crate) - for the session controller and history) ===

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(TegakiError::LayerNotFound(id))
    }

    /// Write a model matrix; the background only ever accepts identity
    pub(crate) fn set_model_matrix(&mut self, id: LayerId, matrix: Matrix) -> Result<()> {
        let layer = self.layer_mut(id)?;
        if layer.is_background && !matrix.is_identity() {
            return Err(TegakiError::InvalidTarget("background layer cannot be transformed".to_string()));
        }
        layer.model_matrix = matrix;
        Ok(())
    }

    /// Replace every layer (history restore, document load)
    pub(crate) fn replace_layers(&mut self, layers: Vec<Layer>, active: usize) {
        for layer in &layers {
            self.ids.observe(layer.id);
        }
        self.active = active.min(layers.len().saturating_sub(1));
        self.layers = layers;
    }

    pub(crate) fn from_parts(width: u32, height: u32, kind: PayloadKind, layers: Vec<Layer>, active: usize) -> Self {
        let mut store = Self {
            width,
            height,
            kind,
            layers: Vec::new(),
            active: 0,
            ids: LayerIdGenerator::new(),
        };
        store.replace_layers(layers, active);
        store
    }

    /// Check the background invariant (used by tests and after restores)
    pub fn check_invariants(&self) -> bool {
        let backgrounds = self.layers.iter().filter(|l| l.is_background).count();
        backgrounds == 1
            && self.layers.first().map(|l| l.is_background && l.model_matrix.is_identity()).unwrap_or(false)
            && self.active < self.layers.len()
    }
}

fn fade(color: [u8; 4], opacity: f64) -> [u8; 4] {
    let alpha = (color[3] as f64 * opacity.clamp(0.0, 1.0)).round() as u8;
    [color[0], color[1], color[2], alpha]
}

/// Fresh background content: opaque white for raster, empty for paths
pub(crate) fn background_payload(kind: PayloadKind, width: u32, height: u32) -> Payload {
    match kind {
        PayloadKind::Raster => Payload::Raster(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]))),
        PayloadKind::Paths => Payload::blank(PayloadKind::Paths, width, height),
    }
}
