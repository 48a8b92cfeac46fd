//! Editor configuration (persistent)
//!
//! Tunables for the transform session and the render bridge. Loaded from a
//! JSON file in the platform config directory; missing fields take their
//! defaults and a malformed file falls back to the defaults entirely.

use crate::error::{Result, TegakiError};
use crate::matrix::MIN_SCALE;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Point that rotate/scale gestures pivot about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PivotPolicy {
    /// Center of the document
    CanvasCenter,
    /// Center of the target layer's payload, in world space
    LayerCenter,
}

/// Sampling used when baking or merging transformed rasters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResamplePolicy {
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorConfig {
    /// Pointer movement (world px) that turns a pending session into a drag
    pub drag_epsilon: f64,
    /// Minimum scale magnitude kept by interactive scaling
    pub min_scale: f64,
    /// Pivot for rotate/scale gestures and flips
    pub pivot: PivotPolicy,
    /// Resampling for raster bakes and merges
    pub resample: ResamplePolicy,
    /// Radians of rotation per horizontal pixel of drag
    pub rotate_sensitivity: f64,
    /// Exponential scale rate per vertical pixel of drag
    pub scale_sensitivity: f64,
    /// Distance moved by one nudge step
    pub nudge_step: f64,
    /// History entries kept before the oldest are dropped
    pub max_undo_depth: usize,
    /// Oversampling factor of the render backend, used by hit testing
    pub supersample: f64,
    /// Flip on an idle layer bakes and records history in one step
    pub flip_commits_immediately: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            drag_epsilon: 0.5,
            min_scale: MIN_SCALE,
            pivot: PivotPolicy::CanvasCenter,
            resample: ResamplePolicy::Bilinear,
            rotate_sensitivity: 0.01,
            scale_sensitivity: 0.005,
            nudge_step: 1.0,
            max_undo_depth: 100,
            supersample: 1.0,
            flip_commits_immediately: true,
        }
    }
}

impl EditorConfig {
    /// Load config from the standard location
    /// Returns defaults if the file doesn't exist or is malformed
    pub fn load() -> Self {
        match Self::config_path().and_then(|path| Self::load_from(&path)) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load editor config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    /// Load config from an explicit path
    ///
    /// A missing file yields the defaults; unreadable or invalid JSON is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: EditorConfig =
            serde_json::from_str(&contents).map_err(|e| TegakiError::Config(e.to_string()))?;
        Ok(config.sanitized())
    }

    /// Save config to the standard location
    /// Logs error but doesn't block if save fails
    pub fn save(&self) {
        if let Err(e) = Self::config_path().and_then(|path| self.save_to(&path)) {
            warn!("Failed to save editor config: {}", e);
        }
    }

    /// Save atomically (write to temp, then rename)
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| TegakiError::Config(e.to_string()))?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(temp_path, path)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "tegaki")
            .ok_or_else(|| TegakiError::Config("failed to determine config directory".to_string()))?;
        Ok(proj_dirs.config_dir().join("editor.json"))
    }

    /// Replace out-of-range values with defaults
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.drag_epsilon.is_finite() && self.drag_epsilon >= 0.0) {
            self.drag_epsilon = defaults.drag_epsilon;
        }
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            self.min_scale = defaults.min_scale;
        }
        if !self.rotate_sensitivity.is_finite() {
            self.rotate_sensitivity = defaults.rotate_sensitivity;
        }
        if !self.scale_sensitivity.is_finite() {
            self.scale_sensitivity = defaults.scale_sensitivity;
        }
        if !(self.nudge_step.is_finite() && self.nudge_step > 0.0) {
            self.nudge_step = defaults.nudge_step;
        }
        if self.max_undo_depth == 0 {
            self.max_undo_depth = defaults.max_undo_depth;
        }
        if !(self.supersample.is_finite() && self.supersample > 0.0) {
            self.supersample = defaults.supersample;
        }
        self
    }
}
