//! Swapchain management.
//!
//! A [`SwapChain`] owns the presentable images, one depth buffer and one
//! framebuffer per image, the render pass they share, and the per-frame
//! synchronization objects. It is rebuilt wholesale on resize; the rebuilt
//! chain must keep the previous chain's attachment formats.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocatedImage;
use crate::surface::{calculate_extent, select_image_count};
use crate::sync::{FrameSlots, FrameSync};
use crate::transition::aspect_mask;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Attachment formats of a swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainFormats {
    pub color: vk::Format,
    pub depth: vk::Format,
}

impl SwapChainFormats {
    /// Aspects a depth attachment view must cover, including stencil when
    /// the depth format carries one.
    pub fn depth_aspect(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.depth)
    }

    /// Fail if a rebuilt chain picked different formats than `previous`.
    ///
    /// Pipelines are built against the render pass, so a format change would
    /// silently invalidate all of them.
    pub fn ensure_compatible(&self, previous: &Self) -> Result<()> {
        if self == previous {
            Ok(())
        } else {
            Err(GpuError::SwapChainFormatChanged {
                previous: (previous.color, previous.depth),
                current: (self.color, self.depth),
            })
        }
    }
}

/// Result of asking for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered to.
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface changed; the chain must be rebuilt before rendering.
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented and still matching the surface.
    Presented,
    /// Presented, but the chain no longer matches the surface exactly.
    Suboptimal,
    /// The surface changed; the chain must be rebuilt.
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the chain should be rebuilt.
    pub fn needs_recreation(self) -> bool {
        self != Self::Presented
    }
}

fn acquire_outcome(result: ash::prelude::VkResult<(u32, bool)>) -> Result<AcquireOutcome> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal,
        }),
        // No image was acquired; the caller must recreate the swapchain.
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(GpuError::from(e)),
    }
}

fn present_outcome(result: ash::prelude::VkResult<bool>) -> Result<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(GpuError::from(e)),
    }
}

/// Swapchain creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainOptions {
    /// Present with FIFO.
    pub vsync: bool,
    /// Number of frame slots.
    pub frames_in_flight: usize,
}

impl Default for SwapChainOptions {
    fn default() -> Self {
        Self {
            vsync: true,
            frames_in_flight: cinder_core::constants::DEFAULT_FRAMES_IN_FLIGHT,
        }
    }
}

/// Presentable images with their attachments and frame synchronization.
pub struct SwapChain {
    device: Arc<Device>,
    options: SwapChainOptions,

    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth_images: Vec<AllocatedImage>,
    depth_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,

    formats: SwapChainFormats,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    window_extent: vk::Extent2D,

    frame_sync: Vec<FrameSync>,
    slots: FrameSlots,
}

impl SwapChain {
    /// Build a swapchain for the current surface.
    ///
    /// With `previous`, the old chain is handed to the driver for reuse and
    /// destroyed once the new one exists. The new chain must keep the old
    /// chain's formats.
    pub fn new(
        device: &Arc<Device>,
        window_extent: vk::Extent2D,
        options: SwapChainOptions,
        previous: Option<Self>,
    ) -> Result<Self> {
        let mut chain = Self {
            device: Arc::clone(device),
            options,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            depth_images: Vec::new(),
            depth_views: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            formats: SwapChainFormats {
                color: vk::Format::UNDEFINED,
                depth: vk::Format::UNDEFINED,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            window_extent,
            frame_sync: Vec::new(),
            slots: FrameSlots::new(options.frames_in_flight, 0),
        };

        // Anything created before a failure is released by Drop.
        let old_handle = previous
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |p| p.swapchain);
        chain.create_swap_chain(old_handle)?;
        chain.create_image_views()?;
        chain.create_render_pass()?;
        chain.create_depth_resources()?;
        chain.create_framebuffers()?;
        chain.create_sync_objects()?;

        if let Some(previous) = previous {
            chain.formats.ensure_compatible(&previous.formats)?;
        }

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}/{:?}, {:?}",
            chain.extent.width,
            chain.extent.height,
            chain.images.len(),
            chain.formats.color,
            chain.formats.depth,
            chain.present_mode
        );

        Ok(chain)
    }

    fn create_swap_chain(&mut self, old_swapchain: vk::SwapchainKHR) -> Result<()> {
        let support = self.device.swap_chain_support()?;
        let surface_format = support.recommended_format().ok_or_else(|| {
            GpuError::SwapchainCreation("surface reports no formats".to_string())
        })?;
        let present_mode = support.recommended_present_mode(self.options.vsync);
        let extent = calculate_extent(&support.capabilities, self.window_extent);
        let image_count = select_image_count(&support.capabilities);

        let queue_families = [
            self.device.graphics_queue_family(),
            self.device.present_queue_family(),
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.device.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if queue_families[0] == queue_families[1] {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        };

        let loader = self.device.swapchain_loader();
        self.swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?
        };
        self.images = unsafe { loader.get_swapchain_images(self.swapchain)? };

        self.formats.color = surface_format.format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.slots = FrameSlots::new(self.options.frames_in_flight, self.images.len());

        Ok(())
    }

    fn create_image_views(&mut self) -> Result<()> {
        for &image in &self.images {
            let view = self.device.create_image_view(
                image,
                self.formats.color,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            self.image_views.push(view);
        }
        Ok(())
    }

    fn create_render_pass(&mut self) -> Result<()> {
        self.formats.depth = self.device.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let attachments = [
            vk::AttachmentDescription::default()
                .format(self.formats.color)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(self.formats.depth)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];

        let dependencies = render_pass_dependencies();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.render_pass = unsafe {
            self.device
                .handle()
                .create_render_pass(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(format!("render pass: {e}")))?
        };
        Ok(())
    }

    fn create_depth_resources(&mut self) -> Result<()> {
        let depth_format = self.formats.depth;
        let depth_aspect = self.formats.depth_aspect();
        for i in 0..self.images.len() {
            let create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(depth_format)
                .extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            let image = self.device.create_image_with_info(
                &create_info,
                MemoryLocation::GpuOnly,
                &format!("swapchain depth {i}"),
            )?;
            let handle = image.handle();
            self.depth_images.push(image);

            let view = self.device.create_image_view(
                handle,
                depth_format,
                depth_aspect,
                1,
            )?;
            self.depth_views.push(view);
        }
        Ok(())
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        for (&color, &depth) in self.image_views.iter().zip(&self.depth_views) {
            let attachments = [color, depth];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe {
                self.device
                    .handle()
                    .create_framebuffer(&create_info, None)
                    .map_err(|e| GpuError::SwapchainCreation(format!("framebuffer: {e}")))?
            };
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn create_sync_objects(&mut self) -> Result<()> {
        for _ in 0..self.options.frames_in_flight {
            let sync = unsafe { FrameSync::new(self.device.handle())? };
            self.frame_sync.push(sync);
        }
        Ok(())
    }

    /// Wait for the active frame slot, then acquire the next image.
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(&self) -> Result<AcquireOutcome> {
        let sync = self.current_sync()?;
        unsafe { sync.wait(self.device.handle())? };

        let result = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available,
                vk::Fence::null(),
            )
        };
        acquire_outcome(result)
    }

    /// Submit `cmd` for `image_index` and present it.
    ///
    /// Waits for whichever frame slot last rendered to the image, then
    /// advances to the next frame slot.
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit_command_buffers(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        let raw = self.device.handle();

        if let Some(owner) = self.slots.claim_image(image_index as usize) {
            if let Some(owner_sync) = self.frame_sync.get(owner) {
                unsafe { owner_sync.wait(raw)? };
            }
        }

        let sync = self.current_sync()?;
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        unsafe {
            sync.reset(raw)?;
            crate::command::submit_command_buffers(
                raw,
                self.device.graphics_queue(),
                &command_buffers,
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                sync.in_flight,
            )?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.device.present_queue(), &present_info)
        };

        self.slots.advance();
        present_outcome(result)
    }

    fn current_sync(&self) -> Result<&FrameSync> {
        self.frame_sync
            .get(self.slots.current())
            .ok_or_else(|| GpuError::InvalidState("frame slot has no sync objects".to_string()))
    }

    /// The render pass every framebuffer was built for.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Framebuffer of image `index`.
    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.framebuffers
            .get(index)
            .copied()
            .unwrap_or(vk::Framebuffer::null())
    }

    /// Presentable image `index`.
    pub fn image(&self, index: usize) -> vk::Image {
        self.images.get(index).copied().unwrap_or(vk::Image::null())
    }

    /// View of presentable image `index`.
    pub fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views
            .get(index)
            .copied()
            .unwrap_or(vk::ImageView::null())
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Attachment formats.
    pub fn formats(&self) -> SwapChainFormats {
        self.formats
    }

    /// Color attachment format.
    pub fn image_format(&self) -> vk::Format {
        self.formats.color
    }

    /// Depth attachment format.
    pub fn depth_format(&self) -> vk::Format {
        self.formats.depth
    }

    /// Chosen present mode.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Width over height.
    pub fn extent_aspect_ratio(&self) -> f32 {
        aspect_ratio(self.extent)
    }

    /// Active frame slot.
    pub fn current_frame(&self) -> usize {
        self.slots.current()
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.frames_in_flight()
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let raw = device.handle();
        let _ = device.wait_idle();
        unsafe {
            for &framebuffer in &self.framebuffers {
                raw.destroy_framebuffer(framebuffer, None);
            }
            raw.destroy_render_pass(self.render_pass, None);
            for &view in self.depth_views.iter().chain(&self.image_views) {
                raw.destroy_image_view(view, None);
            }
        }
        for image in self.depth_images.drain(..) {
            if let Err(e) = device.destroy_image(image) {
                tracing::error!("Failed to free depth image: {e}");
            }
        }
        unsafe {
            device
                .swapchain_loader()
                .destroy_swapchain(self.swapchain, None);
            for sync in &self.frame_sync {
                sync.destroy(raw);
            }
        }
    }
}

/// External-to-subpass dependencies around the attachment writes.
pub fn render_pass_dependencies() -> [vk::SubpassDependency; 2] {
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: attachment_stages,
            dst_stage_mask: attachment_stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::MEMORY_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    ]
}

/// Width over height of `extent`; zero-height extents yield 1.0.
pub fn aspect_ratio(extent: vk::Extent2D) -> f32 {
    if extent.height == 0 {
        return 1.0;
    }
    extent.width as f32 / extent.height as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SRGB_D32: SwapChainFormats = SwapChainFormats {
        color: vk::Format::B8G8R8A8_SRGB,
        depth: vk::Format::D32_SFLOAT,
    };

    #[test]
    fn same_formats_are_compatible() {
        // A resize changes only the extent.
        let rebuilt = SRGB_D32;
        assert!(rebuilt.ensure_compatible(&SRGB_D32).is_ok());
    }

    #[test]
    fn format_drift_is_detected() {
        let color_changed = SwapChainFormats {
            color: vk::Format::B8G8R8A8_UNORM,
            ..SRGB_D32
        };
        assert!(matches!(
            color_changed.ensure_compatible(&SRGB_D32),
            Err(GpuError::SwapChainFormatChanged { .. })
        ));

        let depth_changed = SwapChainFormats {
            depth: vk::Format::D24_UNORM_S8_UINT,
            ..SRGB_D32
        };
        assert!(depth_changed.ensure_compatible(&SRGB_D32).is_err());
    }

    #[test]
    fn acquire_results_map_to_outcomes() {
        assert_eq!(
            acquire_outcome(Ok((2, false))).unwrap(),
            AcquireOutcome::Acquired {
                image_index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            acquire_outcome(Ok((0, true))).unwrap(),
            AcquireOutcome::Acquired {
                image_index: 0,
                suboptimal: true
            }
        );
        assert_eq!(
            acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(acquire_outcome(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn present_results_map_to_outcomes() {
        assert_eq!(present_outcome(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(present_outcome(Ok(true)).unwrap(), PresentOutcome::Suboptimal);
        assert_eq!(
            present_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::OutOfDate
        );
        assert!(present_outcome(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
        assert!(!PresentOutcome::Presented.needs_recreation());
        assert!(PresentOutcome::Suboptimal.needs_recreation());
    }

    #[test]
    fn depth_preference_order() {
        assert_eq!(DEPTH_FORMAT_CANDIDATES[0], vk::Format::D32_SFLOAT);
        assert_eq!(DEPTH_FORMAT_CANDIDATES[2], vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn depth_views_include_stencil_for_combined_formats() {
        for depth in DEPTH_FORMAT_CANDIDATES {
            let formats = SwapChainFormats { depth, ..SRGB_D32 };
            assert!(formats.depth_aspect().contains(vk::ImageAspectFlags::DEPTH));
        }
        let combined = SwapChainFormats {
            depth: vk::Format::D24_UNORM_S8_UINT,
            ..SRGB_D32
        };
        assert_eq!(
            combined.depth_aspect(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(SRGB_D32.depth_aspect(), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn dependencies_bracket_the_subpass() {
        let [incoming, outgoing] = render_pass_dependencies();
        assert_eq!(incoming.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(incoming.dst_subpass, 0);
        assert!(incoming
            .dst_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);
    }

    #[test]
    fn aspect_ratio_handles_zero_height() {
        assert_relative_eq!(
            aspect_ratio(vk::Extent2D {
                width: 1600,
                height: 900
            }),
            16.0 / 9.0
        );
        assert_relative_eq!(aspect_ratio(vk::Extent2D::default()), 1.0);
    }
}
