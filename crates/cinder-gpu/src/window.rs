//! Window collaborator interface.
//!
//! The GPU layer never talks to a windowing library directly. Whatever owns
//! the window implements [`WindowSurface`]; the helpers in
//! [`crate::surface`] cover the raw-window-handle plumbing.

use crate::error::Result;
use ash::vk;
use std::ffi::CStr;

/// What the device and renderer need from a window.
pub trait WindowSurface {
    /// Current drawable size in pixels. Zero in either dimension while minimized.
    fn extent(&self) -> vk::Extent2D;

    /// Wait for the windowing system to deliver new events, or for a short
    /// platform-defined interval to pass.
    ///
    /// Callers re-check [`Self::extent`] after each call and give up after a
    /// bounded number of waits, since they may be running inside the event
    /// loop that would deliver those events.
    fn wait_events(&self);

    /// Instance extensions the platform needs for surface creation.
    fn required_extensions(&self) -> Result<Vec<&'static CStr>>;

    /// Create a presentation surface bound to `instance`.
    ///
    /// # Safety
    /// The instance must be valid and outlive the returned surface.
    unsafe fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;
}
