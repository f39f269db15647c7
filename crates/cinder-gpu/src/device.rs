//! Vulkan device management.
//!
//! [`Device`] owns the instance, the presentation surface, the logical device
//! with its queues, the memory allocator and a command pool for one-shot
//! work. Everything else in the crate holds an `Arc<Device>`.

use crate::buffer::BufferLayout;
use crate::capabilities::GpuCapabilities;
use crate::command::{self, CommandPool};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, DebugMessenger};
use crate::memory::{AllocatedBuffer, AllocatedImage, GpuAllocator};
use crate::surface::SwapChainSupport;
use crate::transition::{find_transition, image_barrier};
use crate::window::WindowSurface;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Logical device plus everything it needs to create and move resources.
pub struct Device {
    // Entry must be kept alive for the lifetime of the device
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,
    swapchain_loader: ash::khr::swapchain::Device,
    command_pool: CommandPool,

    graphics_queue_family: u32,
    present_queue_family: u32,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl Device {
    /// Logical device handle.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Shared logical device handle.
    pub fn shared_handle(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Physical device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Physical device limits.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Capability snapshot taken at selection time.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Memory allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Presentation surface.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader.
    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    /// Swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Command pool on the graphics family.
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.handle()
    }

    /// Graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Present queue.
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Present queue family index.
    pub fn present_queue_family(&self) -> u32 {
        self.present_queue_family
    }

    /// Re-query surface support; the result changes with the window.
    pub fn swap_chain_support(&self) -> Result<SwapChainSupport> {
        unsafe { SwapChainSupport::query(&self.surface_loader, self.physical_device, self.surface) }
    }

    /// First candidate whose tiling supports `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = unsafe {
                    self.instance
                        .get_physical_device_format_properties(self.physical_device, format)
                };
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .ok_or_else(|| GpuError::NoSupportedFormat(candidates.to_vec()))
    }

    /// Create a buffer with bound memory.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer> {
        self.allocator
            .lock()
            .create_buffer(size, usage, location, name)
    }

    /// Create a buffer of `instance_count` elements, each padded to `min_alignment`.
    pub fn create_buffer_with_alignment(
        &self,
        instance_size: u64,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        min_alignment: u64,
        name: &str,
    ) -> Result<(AllocatedBuffer, BufferLayout)> {
        let layout = BufferLayout::new(instance_size, instance_count, min_alignment);
        let buffer = self.create_buffer(layout.total_size(), usage, location, name)?;
        Ok((buffer, layout))
    }

    /// Destroy a buffer together with its memory.
    pub fn destroy_buffer(&self, buffer: AllocatedBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// Create an image with bound memory.
    pub fn create_image_with_info(
        &self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedImage> {
        self.allocator
            .lock()
            .create_image(create_info, location, name)
    }

    /// Destroy an image together with its memory.
    pub fn destroy_image(&self, image: AllocatedImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }

    /// Create a 2D view over every mip level of `image`.
    pub fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(mip_levels)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = unsafe { self.device.create_image_view(&create_info, None)? };
        Ok(view)
    }

    /// Allocate primary command buffers from the device's pool.
    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        unsafe {
            self.command_pool
                .allocate_command_buffers(&self.device, vk::CommandBufferLevel::PRIMARY, count)
        }
    }

    /// Return command buffers to the device's pool.
    ///
    /// # Safety
    /// The buffers must come from [`Device::allocate_command_buffers`] and
    /// must not be pending execution.
    pub unsafe fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.command_pool
            .free_command_buffers(&self.device, command_buffers);
    }

    /// Begin a one-shot command buffer.
    pub fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer> {
        unsafe { command::begin_single_time_commands(&self.device, &self.command_pool) }
    }

    /// Submit a one-shot command buffer and wait for the graphics queue to go idle.
    pub fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            command::end_single_time_commands(
                &self.device,
                &self.command_pool,
                self.graphics_queue,
                cmd,
            )
        }
    }

    /// Record into `cmd` when given, otherwise into a blocking one-shot buffer.
    fn record<F>(&self, cmd: Option<vk::CommandBuffer>, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        match cmd {
            Some(cmd) => {
                f(cmd);
                Ok(())
            }
            None => unsafe {
                command::execute_single_time_commands(
                    &self.device,
                    &self.command_pool,
                    self.graphics_queue,
                    f,
                )
            },
        }
    }

    /// Move an image between layouts listed in the transition table.
    ///
    /// With `cmd` the barrier is only recorded; without it the transition is
    /// submitted and waited on.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_image_layout(
        &self,
        image: vk::Image,
        format: vk::Format,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        mip_levels: u32,
        layer_count: u32,
        cmd: Option<vk::CommandBuffer>,
    ) -> Result<()> {
        let transition = find_transition(old_layout, new_layout)?;
        let barrier = image_barrier(image, format, transition, mip_levels, layer_count);

        self.record(cmd, |cmd| unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Copy `size` bytes between buffers, blocking until done.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Result<()> {
        let region = vk::BufferCopy::default().size(size);
        self.record(None, |cmd| unsafe {
            self.device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })
    }

    /// Copy tightly packed texel data from a buffer into an image in
    /// `TRANSFER_DST_OPTIMAL` layout.
    pub fn copy_buffer_to_image(
        &self,
        buffer: vk::Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
        layer_count: u32,
        cmd: Option<vk::CommandBuffer>,
    ) -> Result<()> {
        let region = full_image_copy(width, height, layer_count);
        self.record(cmd, |cmd| unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    /// Copy an image in `TRANSFER_SRC_OPTIMAL` layout into a buffer.
    ///
    /// Used for screenshot capture.
    pub fn copy_image_to_buffer(
        &self,
        image: vk::Image,
        buffer: vk::Buffer,
        width: u32,
        height: u32,
        layer_count: u32,
        cmd: Option<vk::CommandBuffer>,
    ) -> Result<()> {
        let region = full_image_copy(width, height, layer_count);
        self.record(cmd, |cmd| unsafe {
            self.device.cmd_copy_image_to_buffer(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                &[region],
            );
        })
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

fn full_image_copy(width: u32, height: u32, layer_count: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(layer_count),
        )
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.command_pool.destroy(&self.device);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a [`Device`].
pub struct DeviceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cinder".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the device for `window`.
    pub fn build<W>(self, window: &W) -> Result<Device>
    where
        W: WindowSurface + ?Sized,
    {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Loading(e.to_string()))?;

        let window_extensions = window.required_extensions()?;
        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                &window_extensions,
            )
        }?;

        // From here on every early return must unwind what was already created.
        let debug_messenger = if self.enable_validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = match unsafe { window.create_surface(&entry, &instance) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { destroy_instance(&instance, debug_messenger.as_ref()) };
                return Err(e);
            }
        };

        match unsafe {
            Self::create_logical(&instance, &surface_loader, surface)
        } {
            Ok(parts) => {
                let LogicalParts {
                    physical_device,
                    properties,
                    capabilities,
                    device,
                    families,
                    graphics_queue,
                    present_queue,
                } = parts;

                let device = Arc::new(device);
                let allocator = unsafe {
                    GpuAllocator::new(&instance, Arc::clone(&device), physical_device)
                };
                let allocator = match allocator {
                    Ok(allocator) => allocator,
                    Err(e) => {
                        unsafe {
                            device.destroy_device(None);
                            surface_loader.destroy_surface(surface, None);
                            destroy_instance(&instance, debug_messenger.as_ref());
                        }
                        return Err(e);
                    }
                };

                let command_pool = match unsafe {
                    CommandPool::new(
                        &device,
                        families.graphics,
                        vk::CommandPoolCreateFlags::TRANSIENT
                            | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    )
                } {
                    Ok(pool) => pool,
                    Err(e) => {
                        drop(allocator);
                        unsafe {
                            device.destroy_device(None);
                            surface_loader.destroy_surface(surface, None);
                            destroy_instance(&instance, debug_messenger.as_ref());
                        }
                        return Err(e);
                    }
                };

                let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

                tracing::info!("Selected GPU: {}", capabilities.summary());

                Ok(Device {
                    entry,
                    instance,
                    debug_messenger,
                    surface_loader,
                    surface,
                    physical_device,
                    properties,
                    device,
                    capabilities,
                    allocator: Mutex::new(allocator),
                    swapchain_loader,
                    command_pool,
                    graphics_queue_family: families.graphics,
                    present_queue_family: families.present,
                    graphics_queue,
                    present_queue,
                })
            }
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    destroy_instance(&instance, debug_messenger.as_ref());
                }
                Err(e)
            }
        }
    }

    /// Pick a physical device and create the logical device on it.
    ///
    /// # Safety
    /// The instance and surface must be valid.
    unsafe fn create_logical(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<LogicalParts> {
        let (physical_device, capabilities, families) =
            select_physical_device(instance, surface_loader, surface)?;
        let properties = instance.get_physical_device_properties(physical_device);

        let (device, graphics_queue, present_queue) =
            create_device(instance, physical_device, &capabilities, &families)?;

        Ok(LogicalParts {
            physical_device,
            properties,
            capabilities,
            device,
            families,
            graphics_queue,
            present_queue,
        })
    }
}

struct LogicalParts {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    capabilities: GpuCapabilities,
    device: ash::Device,
    families: QueueFamilyIndices,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

unsafe fn destroy_instance(instance: &ash::Instance, messenger: Option<&DebugMessenger>) {
    if let Some(messenger) = messenger {
        messenger.destroy();
    }
    instance.destroy_instance(None);
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueFamilyIndices {
    graphics: u32,
    present: u32,
}

impl QueueFamilyIndices {
    fn unique(&self) -> BTreeSet<u32> {
        [self.graphics, self.present].into_iter().collect()
    }
}

/// Select the first device that can render to `surface`.
///
/// # Safety
/// The instance and surface must be valid.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, GpuCapabilities, QueueFamilyIndices)> {
    let devices = instance.enumerate_physical_devices()?;
    tracing::debug!("Found {} physical device(s)", devices.len());

    let mut rejection = None;
    for physical_device in devices {
        let capabilities = GpuCapabilities::query(instance, physical_device);

        if let Err(e) = capabilities.check_requirements() {
            tracing::debug!("Skipping device: {e}");
            rejection = Some(e);
            continue;
        }

        let Some(families) = find_queue_families(instance, surface_loader, surface, physical_device)
        else {
            tracing::debug!("Skipping {}: no graphics/present queues", capabilities.device_name);
            continue;
        };

        let adequate = SwapChainSupport::query(surface_loader, physical_device, surface)
            .map(|support| support.is_adequate())
            .unwrap_or(false);
        if !adequate {
            tracing::debug!("Skipping {}: inadequate surface support", capabilities.device_name);
            continue;
        }

        return Ok((physical_device, capabilities, families));
    }

    Err(rejection.unwrap_or(GpuError::NoSuitableDevice))
}

/// Find the first graphics family and a present-capable family.
///
/// # Safety
/// All handles must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Option<QueueFamilyIndices> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut present_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        if family.queue_count > 0
            && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && graphics_family.is_none()
        {
            graphics_family = Some(i);
        }

        let presents = surface_loader
            .get_physical_device_surface_support(physical_device, i, surface)
            .unwrap_or(false);
        if family.queue_count > 0 && presents && present_family.is_none() {
            present_family = Some(i);
        }

        if graphics_family.is_some() && present_family.is_some() {
            break;
        }
    }

    Some(QueueFamilyIndices {
        graphics: graphics_family?,
        present: present_family?,
    })
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::swapchain::NAME];

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME);

    extensions
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: &GpuCapabilities,
    families: &QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions();
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let bindless = capabilities.bindless_enabled();
    let mut vulkan_1_2_features = if bindless {
        vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
    } else {
        vk::PhysicalDeviceVulkan12Features::default()
    };

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .fill_mode_non_solid(capabilities.supports_fill_mode_non_solid);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    tracing::debug!(
        "Logical device created: graphics family {}, present family {}, bindless {}",
        families.graphics,
        families.present,
        bindless
    );

    let graphics_queue = device.get_device_queue(families.graphics, 0);
    let present_queue = device.get_device_queue(families.present, 0);

    Ok((device, graphics_queue, present_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_family_is_created_once() {
        let families = QueueFamilyIndices {
            graphics: 0,
            present: 0,
        };
        assert_eq!(families.unique().len(), 1);

        let split = QueueFamilyIndices {
            graphics: 0,
            present: 2,
        };
        assert_eq!(split.unique().into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn swapchain_extension_is_required() {
        assert!(required_device_extensions().contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn image_copy_covers_whole_extent() {
        let region = full_image_copy(640, 480, 1);
        assert_eq!(region.image_extent.width, 640);
        assert_eq!(region.image_extent.height, 480);
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.buffer_row_length, 0);
        assert_eq!(region.image_subresource.layer_count, 1);
    }
}
