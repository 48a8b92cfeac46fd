//! Error types for the tegaki core
//!
//! Every failure here is handled locally by the store or the session
//! controller. Callers see an inert gesture or a reverted transform, never a
//! layer left half-transformed.

use crate::layer::LayerId;
use thiserror::Error;

/// Errors that can occur while editing layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TegakiError {
    /// Session or structural operation requested on a layer that cannot take it
    #[error("invalid target layer: {0}")]
    InvalidTarget(String),

    /// Layer id does not exist in the store
    #[error("layer {0} not found")]
    LayerNotFound(LayerId),

    /// Matrix could not be inverted
    #[error("matrix is not invertible")]
    SingularMatrix,

    /// Render bridge could not produce a transformed payload
    #[error("transform could not be applied: {0}")]
    BakeFailure(String),

    /// Render bridge failed a draw or composite request
    #[error("render bridge error: {0}")]
    Render(String),

    /// Restored layer data failed validation
    #[error("malformed persisted state: {0}")]
    MalformedPersistedState(String),

    /// A transform session is already open or committing
    #[error("a transform session is already active")]
    SessionActive,

    /// Operation requires an open transform session
    #[error("no transform session is active")]
    NoActiveSession,

    /// Config file could not be read or written
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TegakiError>;

impl From<std::io::Error> for TegakiError {
    fn from(e: std::io::Error) -> Self {
        TegakiError::Config(e.to_string())
    }
}
