//! GPU error types.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant is fatal for the operation that produced it; recoverable
/// conditions (descriptor exhaustion, out-of-date swapchains) have their own
/// status types and never travel through this enum.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Validation was requested but the layer is not installed.
    #[error("Validation layer requested but not available: {0}")]
    ValidationLayerUnavailable(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A rebuilt swapchain picked different attachment formats.
    #[error("Swapchain format changed on rebuild: {previous:?} -> {current:?}")]
    SwapChainFormatChanged {
        previous: (vk::Format, vk::Format),
        current: (vk::Format, vk::Format),
    },

    /// No candidate format supports the requested features.
    #[error("No supported format among {0:?}")]
    NoSupportedFormat(Vec<vk::Format>),

    /// Image layout transition missing from the transition table.
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Shader binary could not be read.
    #[error("Failed to read shader {path}: {reason}")]
    ShaderLoad { path: PathBuf, reason: String },

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Two bindings in one descriptor set layout share an index.
    #[error("Duplicate descriptor binding {0}")]
    DuplicateBinding(u32),

    /// Descriptor pool or layout creation failed.
    #[error("Descriptor creation failed: {0}")]
    DescriptorCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
