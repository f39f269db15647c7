//! Core types for the Cinder renderer.
//!
//! This crate provides the values the GPU layer consumes but does not own:
//! - Engine configuration (asset folders, window, frame pacing)
//! - The engine-wide error type

pub mod config;
pub mod error;

pub use config::{EngineConfig, WindowConfig};
pub use error::{Error, Result};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames whose GPU work may overlap.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
    /// Upper bound on frames in flight accepted from configuration.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
}
