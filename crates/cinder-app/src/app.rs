//! `CinderApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for applications driven by the Cinder runner.
///
/// The runner owns the window, device and renderer. Each frame it calls
/// [`update`](Self::update), then [`prepare`](Self::prepare) outside any
/// render pass, then [`render`](Self::render) inside the swapchain render
/// pass.
pub trait CinderApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window, device and renderer exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// `dt` is the time in seconds since the previous frame.
    fn update(&mut self, ctx: &mut AppContext, dt: f32);

    /// Record work that must happen before the swapchain render pass, such
    /// as uploads or compute dispatches.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn prepare(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Record draws into the swapchain render pass.
    ///
    /// Viewport and scissor are already set to the full swapchain extent.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// The renderer rebuilds the swapchain at the end of the current frame;
    /// recreate any other size-dependent resources here.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was consumed.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release resources before shutdown.
    ///
    /// The device is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
