//! Vulkan resource and frame-synchronization layer for the Cinder renderer.
//!
//! This crate provides:
//! - Device bring-up (instance, validation, surface, queues, allocator)
//! - Buffers with aligned instance layout, mapping and staging uploads
//! - Descriptor layouts, pools and writers, bindless when available
//! - Graphics pipelines from declarative configs and presets
//! - Swapchain ownership and per-frame synchronization
//! - A frame-level renderer with resize recovery

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod copy;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod renderer;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod transition;
pub mod window;

pub use buffer::{get_alignment, Buffer, BufferDesc, BufferLayout};
pub use capabilities::{BindlessSupport, GpuCapabilities, GpuVendor};
pub use copy::copy_to_mapped;
pub use deferred::DeferredDeletionQueue;
pub use descriptors::{
    DescriptorAllocError, DescriptorMode, DescriptorPool, DescriptorPoolBuilder,
    DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
};
pub use device::{Device, DeviceBuilder};
pub use error::{GpuError, Result};
pub use memory::{AllocatedBuffer, AllocatedImage, GpuAllocator};
pub use pipeline::{
    ComputePipeline, Pipeline, PipelineConfig, PipelineLayout, PipelinePreset, ShaderStage,
    SpecializationConstants,
};
pub use renderer::Renderer;
pub use surface::SwapChainSupport;
pub use swapchain::{AcquireOutcome, PresentOutcome, SwapChain, SwapChainFormats, SwapChainOptions};
pub use sync::{FrameSlots, FrameSync};
pub use window::WindowSurface;

pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
