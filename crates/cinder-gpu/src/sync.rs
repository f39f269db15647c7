//! Synchronization primitives.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "trace-spans", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Synchronization objects for one frame slot.
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence to wait for frame completion
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// The fence starts signaled so the first wait on each slot returns
    /// immediately.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_available: create_semaphore(device)?,
            render_finished: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
        })
    }

    /// Wait for this frame slot's previous submission to finish.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        wait_for_fence(device, self.in_flight, u64::MAX)
    }

    /// Reset the fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        reset_fence(device, self.in_flight)
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Frame-slot rotation and presentable-image ownership.
///
/// Frame slots cycle `0..frames_in_flight`. Each presentable image remembers
/// which slot last submitted work targeting it, so a new submission can wait
/// for that slot's fence before touching the image again. Image count and
/// slot count are independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlots {
    frames_in_flight: usize,
    current: usize,
    image_owners: Vec<Option<usize>>,
}

impl FrameSlots {
    /// Create the bookkeeping for `frames_in_flight` slots and `image_count` images.
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        debug_assert!(frames_in_flight > 0, "at least one frame slot is required");
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            image_owners: vec![None; image_count],
        }
    }

    /// Index of the active frame slot.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Number of presentable images tracked.
    pub fn image_count(&self) -> usize {
        self.image_owners.len()
    }

    /// Slot that last submitted work for `image_index`, if any.
    pub fn owner_of(&self, image_index: usize) -> Option<usize> {
        self.image_owners.get(image_index).copied().flatten()
    }

    /// Hand `image_index` to the active slot.
    ///
    /// Returns the slot whose fence must be waited on before the image may be
    /// rendered to again.
    pub fn claim_image(&mut self, image_index: usize) -> Option<usize> {
        let Some(owner) = self.image_owners.get_mut(image_index) else {
            debug_assert!(false, "image index {image_index} out of range");
            return None;
        };
        owner.replace(self.current)
    }

    /// Move to the next frame slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_cycles_after_n_frames() {
        for frames in 1..=3 {
            let mut slots = FrameSlots::new(frames, 3);
            let start = slots.current();
            for _ in 0..frames {
                slots.advance();
            }
            assert_eq!(slots.current(), start);
        }
    }

    #[test]
    fn fence_usage_forms_a_cycle() {
        let frames = 2;
        let mut slots = FrameSlots::new(frames, 3);
        let mut signaled = Vec::new();
        for frame in 0..(frames * 3) {
            let image = frame % 3;
            slots.claim_image(image);
            signaled.push(slots.current());
            slots.advance();
        }
        assert_eq!(signaled, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn claiming_reports_previous_owner() {
        let mut slots = FrameSlots::new(2, 3);

        assert_eq!(slots.claim_image(0), None);
        slots.advance();
        assert_eq!(slots.claim_image(1), None);
        slots.advance();

        // Image 0 was last rendered by slot 0, which is active again.
        assert_eq!(slots.claim_image(0), Some(0));
        slots.advance();

        // Slot 1 now renders into image 0, still owned by slot 0.
        assert_eq!(slots.claim_image(0), Some(0));
        assert_eq!(slots.owner_of(0), Some(1));
    }

    #[test]
    fn image_and_slot_counts_are_independent() {
        let mut slots = FrameSlots::new(3, 2);
        assert_eq!(slots.frames_in_flight(), 3);
        assert_eq!(slots.image_count(), 2);
        for i in 0..6 {
            slots.claim_image(i % 2);
            slots.advance();
        }
        assert_eq!(slots.current(), 0);
        assert_eq!(slots.owner_of(0), Some(1));
        assert_eq!(slots.owner_of(1), Some(2));
    }
}
