//! Save/load records for the layer stack
//!
//! The document file itself belongs to the host application. This module
//! produces and consumes the records it stores: one [`LayerRecord`] per
//! layer, payloads kept out of line and referenced by `payload_ref`.
//!
//! Loading is partial-failure tolerant. A bad matrix becomes identity, a
//! missing or mis-sized payload becomes blank, and every repair is reported
//! back as a [`TegakiError::MalformedPersistedState`] diagnostic.

use crate::error::{Result, TegakiError};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::layer_store::{background_payload, LayerStore};
use crate::matrix::Matrix;
use crate::payload::{Payload, PathPayload, PayloadKind};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

/// Persisted form of one layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRecord {
    pub id: u64,
    pub name: String,
    pub visible: bool,
    pub opacity: f64,
    #[serde(default)]
    pub blend_mode: BlendMode,
    pub payload_ref: String,
    /// Row-major 3x3 or column-major 4x4
    pub model_matrix: Vec<f64>,
    #[serde(default)]
    pub is_background: bool,
}

/// Persisted form of the whole stack, bottom layer first
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_kind")]
    pub kind: PayloadKind,
    #[serde(default)]
    pub active_index: usize,
    pub layers: Vec<LayerRecord>,
}

fn default_kind() -> PayloadKind {
    PayloadKind::Raster
}

impl DocumentRecord {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to serialize document: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to parse document: {e}")))
    }
}

/// Looks up out-of-line payloads by reference
pub trait PayloadResolver {
    fn resolve(&self, payload_ref: &str) -> Option<Payload>;
}

impl PayloadResolver for HashMap<String, Payload> {
    fn resolve(&self, payload_ref: &str) -> Option<Payload> {
        self.get(payload_ref).cloned()
    }
}

/// Encode a payload for storage: PNG for raster, JSON for paths
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Raster(img) => {
            let mut bytes = Vec::new();
            img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
                .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to encode PNG: {e}")))?;
            Ok(bytes)
        }
        Payload::Paths(paths) => serde_json::to_vec(paths)
            .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to encode paths: {e}"))),
    }
}

pub fn decode_payload(kind: PayloadKind, bytes: &[u8]) -> Result<Payload> {
    match kind {
        PayloadKind::Raster => {
            let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
                .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to decode PNG: {e}")))?;
            Ok(Payload::Raster(img.to_rgba8()))
        }
        PayloadKind::Paths => {
            let paths: PathPayload = serde_json::from_slice(bytes)
                .map_err(|e| TegakiError::MalformedPersistedState(format!("failed to decode paths: {e}")))?;
            Ok(Payload::Paths(paths))
        }
    }
}

fn payload_ref(id: LayerId) -> String {
    format!("layer-{}", id.0)
}

impl LayerStore {
    /// Records for every layer plus the payloads they reference
    ///
    /// A layer in the middle of a transform drag is saved as displayed:
    /// its staged content under the live matrix.
    pub fn to_records(&self) -> (DocumentRecord, HashMap<String, Payload>) {
        let mut payloads = HashMap::new();
        let layers = self
            .layers()
            .iter()
            .map(|layer| {
                let key = payload_ref(layer.id());
                payloads.insert(key.clone(), layer.display_payload().clone());
                LayerRecord {
                    id: layer.id().0,
                    name: layer.name().to_string(),
                    visible: layer.visible(),
                    opacity: layer.opacity(),
                    blend_mode: layer.blend_mode(),
                    payload_ref: key,
                    model_matrix: layer.model_matrix().to_array().to_vec(),
                    is_background: layer.is_background(),
                }
            })
            .collect();

        let record = DocumentRecord {
            width: self.width(),
            height: self.height(),
            kind: self.kind(),
            active_index: self.active_index(),
            layers,
        };
        (record, payloads)
    }

    /// Rebuild a store from records, repairing what doesn't validate
    ///
    /// Never fails: the returned diagnostics list each repair that was made.
    pub fn from_records(record: &DocumentRecord, payloads: &dyn PayloadResolver) -> (LayerStore, Vec<TegakiError>) {
        let (width, height, kind) = (record.width, record.height, record.kind);
        let mut diagnostics = Vec::new();
        let mut report = |message: String| {
            warn!("Repairing persisted layer: {}", message);
            diagnostics.push(TegakiError::MalformedPersistedState(message));
        };

        let mut seen = HashSet::new();
        let mut next_free = record
            .layers
            .iter()
            .map(|r| r.id)
            .filter(|&id| id <= LayerId::MAX_PERSISTED)
            .max()
            .map_or(1, |max| max + 1);
        let mut layers = Vec::with_capacity(record.layers.len() + 1);

        for (index, rec) in record.layers.iter().enumerate() {
            let id = if rec.id > LayerId::MAX_PERSISTED {
                report(format!("layer {} has out-of-range id {}, assigned {}", index, rec.id, next_free));
                None
            } else if !seen.insert(rec.id) {
                report(format!("layer {} reuses id {}, assigned {}", index, rec.id, next_free));
                None
            } else {
                Some(LayerId(rec.id))
            };
            let id = id.unwrap_or_else(|| {
                let id = LayerId(next_free);
                seen.insert(next_free);
                next_free += 1;
                id
            });

            let mut matrix = match Matrix::from_slice(&rec.model_matrix) {
                Ok(matrix) => matrix,
                Err(e) => {
                    report(format!("layer {id}: {e}; using identity"));
                    Matrix::IDENTITY
                }
            };

            let payload = match payloads.resolve(&rec.payload_ref) {
                Some(p) if p.kind() == kind && p.dimensions() == (width, height) => p,
                Some(p) => {
                    let (w, h) = p.dimensions();
                    report(format!(
                        "layer {id}: payload '{}' is {:?} {w}x{h}, expected {:?} {width}x{height}; using blank",
                        rec.payload_ref,
                        p.kind(),
                        kind
                    ));
                    Payload::blank(kind, width, height)
                }
                None => {
                    report(format!("layer {id}: payload '{}' not found; using blank", rec.payload_ref));
                    Payload::blank(kind, width, height)
                }
            };

            let mut is_background = rec.is_background;
            if is_background && index != 0 {
                report(format!("layer {id}: background flag on layer {index} ignored"));
                is_background = false;
            }
            if is_background && !matrix.is_identity() {
                report(format!("layer {id}: background had a transform; reset to identity"));
                matrix = Matrix::IDENTITY;
            }

            let opacity = if rec.opacity.is_finite() {
                rec.opacity.clamp(0.0, 1.0)
            } else {
                report(format!("layer {id}: opacity {} is not finite; using 1", rec.opacity));
                1.0
            };

            layers.push(Layer {
                id,
                name: rec.name.clone(),
                visible: rec.visible,
                opacity,
                blend_mode: rec.blend_mode,
                payload: Arc::new(payload),
                preview: None,
                model_matrix: matrix,
                is_background,
            });
        }

        let mut active = record.active_index;
        if !layers.first().is_some_and(|l| l.is_background) {
            report("no background layer; synthesised one".to_string());
            layers.insert(0, Layer::background(LayerId(next_free), background_payload(kind, width, height)));
            active += 1;
        }
        if active >= layers.len() {
            report(format!("active index {} out of range", record.active_index));
            active = layers.len() - 1;
        }

        info!("Loaded {} layers ({} repairs)", layers.len(), diagnostics.len());
        (LayerStore::from_parts(width, height, kind, layers, active), diagnostics)
    }
}
