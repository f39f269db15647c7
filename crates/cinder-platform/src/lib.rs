//! Platform layer for the Cinder renderer.
//!
//! Wraps a winit window so the GPU layer can query its size and create a
//! presentation surface for it.

use std::ffi::CStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;
use cinder_core::WindowConfig;
use cinder_gpu::WindowSurface;
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowAttributes};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// How long [`WindowSurface::wait_events`] sleeps per call.
///
/// winit delivers events through the application handler, which is the
/// caller here, so the window cannot block on the next event. It yields for
/// one frame interval instead and the renderer bounds the number of waits.
pub const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Window attributes built from the engine's window configuration.
pub fn window_attributes(config: &WindowConfig) -> WindowAttributes {
    Window::default_attributes()
        .with_title(&config.title)
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .with_resizable(config.resizable)
}

/// A winit window usable as a presentation target.
#[derive(Clone)]
pub struct PlatformWindow {
    window: Arc<Window>,
}

impl PlatformWindow {
    /// Create a window on the active event loop.
    pub fn create(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let window = event_loop
            .create_window(window_attributes(config))
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;

        let size = window.inner_size();
        tracing::info!(
            "Created window '{}' ({}x{})",
            config.title,
            size.width,
            size.height
        );

        Ok(Self {
            window: Arc::new(window),
        })
    }

    /// Wrap an existing window.
    pub fn from_window(window: Arc<Window>) -> Self {
        Self { window }
    }

    /// The underlying winit window.
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Whether the window currently has no drawable area.
    pub fn is_minimized(&self) -> bool {
        is_zero_extent(self.extent())
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl WindowSurface for PlatformWindow {
    fn extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn wait_events(&self) {
        thread::sleep(MINIMIZED_POLL_INTERVAL);
    }

    fn required_extensions(&self) -> cinder_gpu::Result<Vec<&'static CStr>> {
        cinder_gpu::surface::required_surface_extensions(self)
    }

    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> cinder_gpu::Result<vk::SurfaceKHR> {
        // SAFETY: the caller guarantees the instance outlives the surface
        unsafe { cinder_gpu::surface::create_surface(entry, instance, self) }
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extent_detection() {
        assert!(is_zero_extent(vk::Extent2D {
            width: 0,
            height: 720
        }));
        assert!(is_zero_extent(vk::Extent2D {
            width: 1280,
            height: 0
        }));
        assert!(!is_zero_extent(vk::Extent2D {
            width: 1,
            height: 1
        }));
    }

    #[test]
    fn attributes_follow_config() {
        let config = WindowConfig {
            title: "Demo".to_string(),
            width: 800,
            height: 600,
            resizable: false,
        };
        let attrs = window_attributes(&config);
        assert_eq!(attrs.title, "Demo");
        assert!(!attrs.resizable);
    }
}
