// Tegaki Core Library
// Layer transform model, coordinate pipeline and undo history for the paint tool

pub mod error;
pub mod config;
pub mod matrix;
pub mod coords;
pub mod payload;
pub mod layer;
pub mod layer_store;
pub mod bridge;
pub mod history;
pub mod session;
pub mod redraw;
pub mod persist;
pub mod editor;

pub use error::{Result, TegakiError};
pub use matrix::Matrix;
