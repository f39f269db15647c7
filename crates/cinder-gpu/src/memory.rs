//! GPU memory management.
//!
//! Buffers and images are created together with their memory allocation and
//! handed out as one owning value. The only way to release them is through
//! [`GpuAllocator::free_buffer`] / [`GpuAllocator::free_image`], which consume
//! the value, so a handle can never outlive or be freed apart from its memory.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let _ = self.inner()?.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok(AllocatedBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer and its allocation together.
    pub fn free_buffer(&mut self, mut buffer: AllocatedBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: create_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            let _ = self.inner()?.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        Ok(AllocatedImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
        })
    }

    /// Free an image and its allocation together.
    pub fn free_image(&mut self, mut image: AllocatedImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer bundled with the allocation backing it.
pub struct AllocatedBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
}

impl AllocatedBuffer {
    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes requested at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host pointer of the allocation, if it lives in host-visible memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.cast::<u8>())
    }

    /// Device memory object and offset of the allocation.
    pub fn memory_range(&self) -> Option<(vk::DeviceMemory, u64, u64)> {
        self.allocation
            .as_ref()
            .map(|a| unsafe { (a.memory(), a.offset(), a.size()) })
    }

    /// Whether the handle or its memory is still live, i.e. it was never
    /// passed to [`GpuAllocator::free_buffer`].
    pub fn is_leaked(&self) -> bool {
        self.buffer != vk::Buffer::null() || holds_memory(self.allocation.as_ref())
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        if self.is_leaked() {
            tracing::warn!(
                "Buffer {:?} ({} bytes) dropped without being freed, leaking its memory",
                self.buffer,
                self.size
            );
        }
    }
}

fn holds_memory(allocation: Option<&Allocation>) -> bool {
    allocation.is_some_and(|a| !a.is_null())
}

/// An image bundled with the allocation backing it.
pub struct AllocatedImage {
    pub(crate) image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent3D,
    pub(crate) mip_levels: u32,
    pub(crate) array_layers: u32,
}

impl AllocatedImage {
    /// Raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Number of mip levels.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Number of array layers.
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Whether the handle or its memory is still live, i.e. it was never
    /// passed to [`GpuAllocator::free_image`].
    pub fn is_leaked(&self) -> bool {
        self.image != vk::Image::null() || holds_memory(self.allocation.as_ref())
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        if self.is_leaked() {
            tracing::warn!(
                "Image {:?} ({}x{}) dropped without being freed, leaking its memory",
                self.image,
                self.extent.width,
                self.extent.height
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64, allocation: Option<Allocation>) -> AllocatedBuffer {
        AllocatedBuffer {
            buffer: vk::Buffer::from_raw(raw),
            allocation,
            size: 256,
        }
    }

    #[test]
    fn live_buffer_handle_is_a_leak() {
        assert!(buffer(7, None).is_leaked());
        assert!(buffer(7, Some(Allocation::default())).is_leaked());
    }

    #[test]
    fn released_buffer_is_not_a_leak() {
        assert!(!buffer(0, None).is_leaked());
        assert!(!buffer(0, Some(Allocation::default())).is_leaked());
    }

    #[test]
    fn released_image_is_not_a_leak() {
        let mut image = AllocatedImage {
            image: vk::Image::from_raw(3),
            allocation: None,
            format: vk::Format::D32_SFLOAT,
            extent: vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
        };
        assert!(image.is_leaked());
        image.image = vk::Image::null();
        assert!(!image.is_leaked());
    }
}
