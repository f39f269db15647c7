//! Frame orchestration on top of the swapchain.
//!
//! The [`Renderer`] owns one command buffer per frame slot and keeps the
//! swapchain alive across resizes. A frame is bracketed by
//! [`Renderer::begin_frame`] and [`Renderer::end_frame`]; `begin_frame`
//! returns `None` when the frame has to be skipped because the swapchain was
//! just rebuilt.

use crate::command::{begin_command_buffer, end_command_buffer};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::swapchain::{aspect_ratio, AcquireOutcome, SwapChain, SwapChainOptions};
use crate::window::WindowSurface;
use ash::vk;
use glam::Vec4;
use std::sync::Arc;

/// Default clear color, a dark grey.
pub const DEFAULT_CLEAR_COLOR: Vec4 = Vec4::new(0.01, 0.01, 0.01, 1.0);

/// Waits on a zero-sized window before a rebuild is deferred to a later frame.
const MINIMIZED_WAIT_LIMIT: u32 = 8;

/// Drives frames for one window.
pub struct Renderer<W: WindowSurface> {
    device: Arc<Device>,
    window: Arc<W>,
    options: SwapChainOptions,
    swap_chain: Option<SwapChain>,
    command_buffers: Vec<vk::CommandBuffer>,
    current_image_index: u32,
    is_frame_started: bool,
    resized: bool,
    clear_color: Vec4,
}

impl<W: WindowSurface> Renderer<W> {
    /// Create the swapchain and per-frame command buffers.
    pub fn new(device: &Arc<Device>, window: Arc<W>, options: SwapChainOptions) -> Result<Self> {
        let mut renderer = Self {
            device: Arc::clone(device),
            window,
            options,
            swap_chain: None,
            command_buffers: Vec::new(),
            current_image_index: 0,
            is_frame_started: false,
            resized: false,
            clear_color: DEFAULT_CLEAR_COLOR,
        };
        renderer.recreate_swap_chain()?;
        if renderer.swap_chain.is_none() {
            return Err(GpuError::InvalidState(
                "window has no drawable area".to_string(),
            ));
        }
        renderer.command_buffers = device.allocate_command_buffers(options.frames_in_flight as u32)?;
        Ok(renderer)
    }

    fn swap_chain(&self) -> Result<&SwapChain> {
        self.swap_chain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("swapchain missing".to_string()))
    }

    fn swap_chain_mut(&mut self) -> Result<&mut SwapChain> {
        self.swap_chain
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("swapchain missing".to_string()))
    }

    /// Rebuild the swapchain for the window's current size.
    ///
    /// Waits briefly while the window is minimized. If it stays minimized the
    /// rebuild is deferred and retried at the end of a later frame.
    pub fn recreate_swap_chain(&mut self) -> Result<()> {
        let Some(extent) = wait_for_drawable_extent(&*self.window, MINIMIZED_WAIT_LIMIT)
        else {
            tracing::debug!("Window still minimized, deferring swapchain rebuild");
            self.resized = true;
            return Ok(());
        };

        self.device.wait_idle()?;

        let previous = self.swap_chain.take();
        let rebuilding = previous.is_some();
        self.swap_chain = Some(SwapChain::new(
            &self.device,
            extent,
            self.options,
            previous,
        )?);

        if rebuilding {
            tracing::debug!("Swapchain rebuilt at {}x{}", extent.width, extent.height);
        }
        Ok(())
    }

    /// Acquire an image and start recording.
    ///
    /// Returns `None` when the swapchain was out of date; it has been rebuilt
    /// and the caller should skip this frame.
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_frame(&mut self) -> Result<Option<vk::CommandBuffer>> {
        debug_assert!(!self.is_frame_started, "frame already in progress");
        if self.is_frame_started {
            return Ok(None);
        }

        if self.swap_chain.is_none() {
            self.recreate_swap_chain()?;
            return Ok(None);
        }

        let outcome = self.swap_chain()?.acquire_next_image()?;
        match outcome {
            AcquireOutcome::OutOfDate => {
                self.recreate_swap_chain()?;
                Ok(None)
            }
            AcquireOutcome::Acquired { image_index, .. } => {
                self.current_image_index = image_index;
                self.is_frame_started = true;

                let cmd = self.current_command_buffer()?;
                unsafe {
                    begin_command_buffer(
                        self.device.handle(),
                        cmd,
                        vk::CommandBufferUsageFlags::empty(),
                    )?;
                }
                Ok(Some(cmd))
            }
        }
    }

    /// Finish recording, submit and present.
    ///
    /// Rebuilds the swapchain when presentation reports it stale or the
    /// window was resized.
    #[cfg_attr(
        feature = "trace-spans",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self) -> Result<()> {
        debug_assert!(self.is_frame_started, "no frame in progress");
        if !self.is_frame_started {
            return Ok(());
        }

        let cmd = self.current_command_buffer()?;
        unsafe { end_command_buffer(self.device.handle(), cmd)? };

        let image_index = self.current_image_index;
        let outcome = self
            .swap_chain_mut()?
            .submit_command_buffers(cmd, image_index)?;
        self.is_frame_started = false;

        if outcome.needs_recreation() || self.resized {
            if self.resized {
                tracing::debug!("Window resized, rebuilding swapchain");
            } else {
                tracing::debug!("Swapchain reported {outcome:?}, rebuilding");
            }
            self.resized = false;
            self.recreate_swap_chain()?;
        }
        Ok(())
    }

    /// Begin the main render pass and set viewport and scissor to the full extent.
    pub fn begin_swap_chain_render_pass(&self, cmd: vk::CommandBuffer) -> Result<()> {
        debug_assert!(self.is_frame_started, "no frame in progress");
        debug_assert!(
            self.current_command_buffer().ok() == Some(cmd),
            "render pass begun on another frame's command buffer"
        );

        let swap_chain = self.swap_chain()?;
        let extent = swap_chain.extent();
        let clear_values = clear_values(self.clear_color);
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(swap_chain.render_pass())
            .framebuffer(swap_chain.framebuffer(self.current_image_index as usize))
            .render_area(full_scissor(extent))
            .clear_values(&clear_values);

        let raw = self.device.handle();
        unsafe {
            raw.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            raw.cmd_set_viewport(cmd, 0, &[full_viewport(extent)]);
            raw.cmd_set_scissor(cmd, 0, &[full_scissor(extent)]);
        }
        Ok(())
    }

    /// End the main render pass.
    pub fn end_swap_chain_render_pass(&self, cmd: vk::CommandBuffer) {
        debug_assert!(self.is_frame_started, "no frame in progress");
        unsafe { self.device.handle().cmd_end_render_pass(cmd) };
    }

    /// Request a rebuild at the end of the current frame.
    pub fn mark_resized(&mut self) {
        self.resized = true;
    }

    /// Set the color the main render pass clears to.
    pub fn set_clear_color(&mut self, color: Vec4) {
        self.clear_color = color;
    }

    /// Clear color of the main render pass.
    pub fn clear_color(&self) -> Vec4 {
        self.clear_color
    }

    /// Render pass pipelines must be built against.
    pub fn swap_chain_render_pass(&self) -> vk::RenderPass {
        self.swap_chain
            .as_ref()
            .map_or(vk::RenderPass::null(), SwapChain::render_pass)
    }

    /// Width over height of the swapchain images.
    pub fn aspect_ratio(&self) -> f32 {
        aspect_ratio(self.extent())
    }

    /// Swapchain image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swap_chain
            .as_ref()
            .map_or(vk::Extent2D::default(), SwapChain::extent)
    }

    /// Active frame slot.
    pub fn frame_index(&self) -> usize {
        self.swap_chain.as_ref().map_or(0, SwapChain::current_frame)
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.options.frames_in_flight
    }

    /// Whether a frame is being recorded.
    pub fn is_frame_in_progress(&self) -> bool {
        self.is_frame_started
    }

    /// Command buffer of the active frame slot.
    pub fn current_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.command_buffers
            .get(self.frame_index())
            .copied()
            .ok_or_else(|| GpuError::InvalidState("no command buffer for frame".to_string()))
    }

    /// Swapchain image being rendered this frame.
    pub fn current_image_index(&self) -> u32 {
        self.current_image_index
    }

    /// The device this renderer draws with.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl<W: WindowSurface> Drop for Renderer<W> {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe { self.device.free_command_buffers(&self.command_buffers) };
        self.command_buffers.clear();
        self.swap_chain = None;
    }
}

/// Current extent of `window` once it is non-zero, waiting at most `limit` times.
fn wait_for_drawable_extent<W: WindowSurface + ?Sized>(
    window: &W,
    limit: u32,
) -> Option<vk::Extent2D> {
    let mut extent = window.extent();
    let mut waits = 0;
    while extent.width == 0 || extent.height == 0 {
        if waits == limit {
            return None;
        }
        window.wait_events();
        waits += 1;
        extent = window.extent();
    }
    Some(extent)
}

/// Viewport covering `extent` with the full depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Scissor covering `extent`.
pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Clear values for the color and depth attachments.
pub fn clear_values(color: Vec4) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: color.to_array(),
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;
    use std::ffi::CStr;

    /// Window that becomes drawable after a number of event waits.
    struct RestoringWindow {
        waits_until_restored: u32,
        waits: Cell<u32>,
    }

    impl RestoringWindow {
        fn new(waits_until_restored: u32) -> Self {
            Self {
                waits_until_restored,
                waits: Cell::new(0),
            }
        }
    }

    impl WindowSurface for RestoringWindow {
        fn extent(&self) -> vk::Extent2D {
            if self.waits.get() >= self.waits_until_restored {
                vk::Extent2D {
                    width: 800,
                    height: 600,
                }
            } else {
                vk::Extent2D::default()
            }
        }

        fn wait_events(&self) {
            self.waits.set(self.waits.get() + 1);
        }

        fn required_extensions(&self) -> Result<Vec<&'static CStr>> {
            Ok(Vec::new())
        }

        unsafe fn create_surface(
            &self,
            _entry: &ash::Entry,
            _instance: &ash::Instance,
        ) -> Result<vk::SurfaceKHR> {
            Err(GpuError::SurfaceCreation("headless".to_string()))
        }
    }

    #[test]
    fn drawable_window_needs_no_wait() {
        let window = RestoringWindow::new(0);
        let extent = wait_for_drawable_extent(&window, MINIMIZED_WAIT_LIMIT).unwrap();
        assert_eq!(extent.width, 800);
        assert_eq!(window.waits.get(), 0);
    }

    #[test]
    fn restored_window_is_picked_up_between_waits() {
        let window = RestoringWindow::new(3);
        let extent = wait_for_drawable_extent(&window, MINIMIZED_WAIT_LIMIT).unwrap();
        assert_eq!(extent.height, 600);
        assert_eq!(window.waits.get(), 3);
    }

    #[test]
    fn minimized_window_gives_up_after_limit() {
        let window = RestoringWindow::new(u32::MAX);
        assert!(wait_for_drawable_extent(&window, MINIMIZED_WAIT_LIMIT).is_none());
        assert_eq!(window.waits.get(), MINIMIZED_WAIT_LIMIT);
    }

    #[test]
    fn viewport_covers_extent() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let viewport = full_viewport(extent);
        assert_relative_eq!(viewport.width, 1280.0);
        assert_relative_eq!(viewport.height, 720.0);
        assert_relative_eq!(viewport.max_depth, 1.0);

        let scissor = full_scissor(extent);
        assert_eq!(scissor.offset.x, 0);
        assert_eq!(scissor.extent.width, 1280);
    }

    #[test]
    fn clear_values_use_color_and_far_depth() {
        let values = clear_values(Vec4::new(0.1, 0.2, 0.3, 1.0));
        let color = unsafe { values[0].color.float32 };
        assert_relative_eq!(color[1], 0.2);
        let depth = unsafe { values[1].depth_stencil };
        assert_relative_eq!(depth.depth, 1.0);
        assert_eq!(depth.stencil, 0);
    }

    #[test]
    fn default_clear_is_opaque_dark_grey() {
        assert_relative_eq!(DEFAULT_CLEAR_COLOR.w, 1.0);
        assert!(DEFAULT_CLEAR_COLOR.x < 0.1);
    }
}
