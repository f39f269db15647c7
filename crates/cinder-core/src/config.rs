//! Engine configuration.
//!
//! Holds the values the rendering layer consumes from the outside world:
//! asset folders, window size and title, and frame pacing. Every field has a
//! default so partial TOML files are accepted.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{DEFAULT_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT};
use crate::error::{Error, Result};

/// Window configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Cinder".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl WindowConfig {
    /// Width divided by height, or 1.0 for a degenerate window.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 1.0;
        }
        self.width as f32 / self.height as f32
    }
}

/// Configuration consumed by the GPU layer and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Folder holding compiled SPIR-V shader binaries.
    pub shader_folder: PathBuf,
    /// Folder holding model files (read by asset loaders, not by this layer).
    pub model_folder: PathBuf,
    /// Folder holding texture files (read by asset loaders, not by this layer).
    pub texture_folder: PathBuf,
    pub window: WindowConfig,
    /// Number of frames whose GPU work may overlap.
    pub frames_in_flight: usize,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shader_folder: PathBuf::from("assets/shaders"),
            model_folder: PathBuf::from("assets/models"),
            texture_folder: PathBuf::from("assets/textures"),
            window: WindowConfig::default(),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    /// Create a config with the given window title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            window: WindowConfig {
                title: title.into(),
                ..WindowConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::InvalidData(format!(
                "frames_in_flight must be within 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::InvalidData(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        Ok(())
    }

    /// Full path of a shader binary inside the shader folder.
    pub fn shader_path(&self, file_name: &str) -> PathBuf {
        self.shader_folder.join(file_name)
    }

    /// Full path of a model file inside the model folder.
    pub fn model_path(&self, file_name: &str) -> PathBuf {
        self.model_folder.join(file_name)
    }

    /// Full path of a texture file inside the texture folder.
    pub fn texture_path(&self, file_name: &str) -> PathBuf {
        self.texture_folder.join(file_name)
    }

    /// Set the shader folder.
    pub fn with_shader_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.shader_folder = folder.into();
        self
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            shader_folder = "build/spirv"

            [window]
            title = "Demo"
            "#,
        )
        .unwrap();

        assert_eq!(config.shader_folder, PathBuf::from("build/spirv"));
        assert_eq!(config.window.title, "Demo");
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn rejects_out_of_range_frames_in_flight() {
        assert!(EngineConfig::from_toml_str("frames_in_flight = 0").is_err());
        assert!(EngineConfig::from_toml_str("frames_in_flight = 9").is_err());
        assert!(EngineConfig::from_toml_str("frames_in_flight = 3").is_ok());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = EngineConfig::from_toml_str("frames_in_flight = \"two\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn shader_path_joins_folder() {
        let config = EngineConfig::default().with_shader_folder("shaders");
        assert_eq!(
            config.shader_path("opaque.vert.spv"),
            PathBuf::from("shaders").join("opaque.vert.spv")
        );
    }

    #[test]
    fn aspect_ratio() {
        let config = EngineConfig::default().with_size(1920, 1080);
        assert_relative_eq!(config.window.aspect_ratio(), 16.0 / 9.0);
        let degenerate = WindowConfig {
            height: 0,
            ..WindowConfig::default()
        };
        assert_relative_eq!(degenerate.aspect_ratio(), 1.0);
    }
}
