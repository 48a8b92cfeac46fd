//! Undo/redo history
//!
//! A linear log of full layer-store snapshots with a cursor. Entry 0 is the
//! state the history was started from; every completed stroke, committed
//! transform and structural layer operation pushes one entry.
//!
//! Restoring always rebuilds the whole layer list from the snapshot rather
//! than patching live layers. Payloads are shared through `Arc`, so a
//! snapshot only costs a copy for layers that are written afterwards.

use crate::layer::{BlendMode, Layer, LayerId};
use crate::layer_store::LayerStore;
use crate::matrix::Matrix;
use crate::payload::Payload;
use log::info;
use std::sync::Arc;

/// Frozen copy of one layer
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSnapshot {
    pub id: LayerId,
    pub name: String,
    pub visible: bool,
    pub opacity: f64,
    pub blend_mode: BlendMode,
    pub payload: Arc<Payload>,
    /// Row-major 3x3
    pub matrix: [f64; 9],
    pub is_background: bool,
}

impl LayerSnapshot {
    fn capture(layer: &Layer) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
            payload: Arc::clone(&layer.payload),
            matrix: layer.model_matrix.to_array(),
            is_background: layer.is_background,
        }
    }

    fn rebuild(&self) -> Layer {
        Layer {
            id: self.id,
            name: self.name.clone(),
            visible: self.visible,
            opacity: self.opacity,
            blend_mode: self.blend_mode,
            payload: Arc::clone(&self.payload),
            preview: None,
            model_matrix: Matrix::from_slice(&self.matrix).unwrap_or(Matrix::IDENTITY),
            is_background: self.is_background,
        }
    }
}

/// Immutable snapshot of the whole layer list
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    description: String,
    layers: Vec<LayerSnapshot>,
    active_index: usize,
}

impl HistoryEntry {
    /// Capture the store as it is now
    ///
    /// Only meaningful while no transform preview is showing; a dragging
    /// layer's live payload is blank.
    pub fn capture(store: &LayerStore, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            layers: store.layers().iter().map(LayerSnapshot::capture).collect(),
            active_index: store.active_index(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn layers(&self) -> &[LayerSnapshot] {
        &self.layers
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    /// Replace the store's layers with this snapshot
    pub fn restore_into(&self, store: &mut LayerStore) {
        let layers = self.layers.iter().map(LayerSnapshot::rebuild).collect();
        store.replace_layers(layers, self.active_index);
    }
}

/// Linear undo/redo stack
#[derive(Debug)]
pub struct History {
    entries: Vec<HistoryEntry>,
    cursor: usize,
    /// Maximum number of undoable steps
    max_depth: usize,
}

impl History {
    /// Start a history whose base state is the current store
    pub fn new(store: &LayerStore, max_depth: usize) -> Self {
        Self {
            entries: vec![HistoryEntry::capture(store, "Initial state")],
            cursor: 0,
            max_depth: max_depth.max(1),
        }
    }

    /// Append an entry, discarding any redo tail
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.truncate(self.cursor + 1);
        info!("History: {}", entry.description);
        self.entries.push(entry);
        self.cursor = self.entries.len() - 1;
        self.trim();
    }

    /// Capture the store and push it
    pub fn record(&mut self, store: &LayerStore, description: impl Into<String>) {
        self.push(HistoryEntry::capture(store, description));
    }

    /// Step back; returns false when there is nothing to undo
    pub fn undo(&mut self, store: &mut LayerStore) -> bool {
        if self.cursor == 0 {
            return false;
        }
        info!("Undo: {}", self.entries[self.cursor].description);
        self.cursor -= 1;
        self.entries[self.cursor].restore_into(store);
        true
    }

    /// Step forward; returns false when there is nothing to redo
    pub fn redo(&mut self, store: &mut LayerStore) -> bool {
        if self.cursor + 1 >= self.entries.len() {
            return false;
        }
        self.cursor += 1;
        info!("Redo: {}", self.entries[self.cursor].description);
        self.entries[self.cursor].restore_into(store);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    /// Description of the step `undo` would revert
    pub fn undo_description(&self) -> Option<&str> {
        self.can_undo().then(|| self.entries[self.cursor].description.as_str())
    }

    /// Description of the step `redo` would reapply
    pub fn redo_description(&self) -> Option<&str> {
        self.entries.get(self.cursor + 1).map(|e| e.description.as_str())
    }

    /// Number of entries, including the base state
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.cursor]
    }

    /// Drop all steps and rebase on the current store
    pub fn clear(&mut self, store: &LayerStore) {
        self.entries = vec![HistoryEntry::capture(store, "Initial state")];
        self.cursor = 0;
    }

    pub fn set_max_depth(&mut self, depth: usize) {
        self.max_depth = depth.max(1);
        self.trim();
    }

    fn trim(&mut self) {
        if self.entries.len() > self.max_depth + 1 {
            let remove_count = self.entries.len() - (self.max_depth + 1);
            self.entries.drain(0..remove_count);
            self.cursor = self.cursor.saturating_sub(remove_count);
        }
    }
}
