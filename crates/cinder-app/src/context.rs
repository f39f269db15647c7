//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use cinder_core::EngineConfig;
use cinder_gpu::{Buffer, DeferredDeletionQueue, Device, Renderer};
use cinder_platform::PlatformWindow;

/// Everything an application needs to create resources and record frames.
pub struct AppContext {
    /// Frame driver for the window.
    pub renderer: Renderer<PlatformWindow>,
    /// The logical device shared by every GPU object.
    pub device: Arc<Device>,
    /// The presentation window.
    pub window: Arc<PlatformWindow>,
    /// Configuration the application was started with.
    pub config: EngineConfig,
    /// Total frames submitted.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
    pub(crate) deletion_queue: DeferredDeletionQueue,
}

impl AppContext {
    pub(crate) fn new(
        renderer: Renderer<PlatformWindow>,
        device: Arc<Device>,
        window: Arc<PlatformWindow>,
        config: EngineConfig,
    ) -> Self {
        let deletion_queue = DeferredDeletionQueue::new(renderer.frames_in_flight());
        Self {
            renderer,
            device,
            window,
            config,
            frame_count: 0,
            last_frame_time: Instant::now(),
            deletion_queue,
        }
    }

    /// Swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.extent()
    }

    /// Width over height of the swapchain.
    pub fn aspect_ratio(&self) -> f32 {
        self.renderer.aspect_ratio()
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.renderer.frames_in_flight()
    }

    /// Retire a buffer that in-flight frames may still read.
    ///
    /// It is dropped once every frame that could reference it has completed.
    pub fn retire_buffer(&mut self, buffer: Buffer) {
        self.deletion_queue.queue(buffer, self.frame_count);
    }

    /// Buffers still waiting for their frames to complete.
    pub fn pending_deletions(&self) -> usize {
        self.deletion_queue.pending_count()
    }
}
