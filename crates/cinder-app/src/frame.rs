//! Per-frame context for rendering.

use ash::vk;

/// Context for the frame being recorded.
pub struct FrameContext {
    /// Command buffer for this frame slot, in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// Frame slot in `0..frames_in_flight`.
    pub frame_index: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Monotonic frame counter.
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(
        command_buffer: vk::CommandBuffer,
        image_index: u32,
        frame_index: usize,
        dt: f32,
        frame_number: u64,
    ) -> Self {
        Self {
            command_buffer,
            image_index,
            frame_index,
            dt,
            frame_number,
        }
    }
}
