//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When using multiple frames in flight, GPU resources cannot be freed immediately
//! as they may still be in use by a previous frame. Buffers retired during
//! steady-state rendering are parked here until every frame that could still
//! reference them has completed.

use crate::buffer::Buffer;
use std::collections::VecDeque;

/// A buffer pending deletion.
struct PendingDeletion {
    buffer: Buffer,
    frame_queued: u64,
}

/// Queue for deferred buffer deletions.
///
/// Buffers are queued with a frame number and only dropped once enough frames
/// have passed to guarantee they are no longer in use by any in-flight frame.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a queue that keeps buffers alive for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a buffer for deferred deletion.
    pub fn queue(&mut self, buffer: Buffer, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            buffer,
            frame_queued: frame_number,
        });
    }

    /// Drop buffers that are safe to delete.
    ///
    /// Call this at the start of each frame, after the frame slot's fence wait.
    pub fn process(&mut self, current_frame_number: u64) {
        let ready = ready_count(
            self.pending.iter().map(|p| p.frame_queued),
            current_frame_number,
            self.frames_in_flight,
        );
        if ready > 0 {
            tracing::trace!("Releasing {ready} deferred buffer(s)");
        }
        self.pending.drain(..ready).for_each(|p| drop(p.buffer));
    }

    /// Drop all pending buffers immediately.
    ///
    /// Call this during shutdown after the device is idle.
    pub fn flush(&mut self) {
        self.pending.clear();
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Update the frames in flight count.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: usize) {
        self.frames_in_flight = frames_in_flight;
    }
}

/// Number of leading entries queued early enough to be released.
///
/// Queue order is FIFO and frame numbers are non-decreasing, so only a prefix
/// can mature.
fn ready_count(
    queued_frames: impl Iterator<Item = u64>,
    current_frame_number: u64,
    frames_in_flight: usize,
) -> usize {
    let cutoff = current_frame_number.saturating_sub(frames_in_flight as u64);
    queued_frames.take_while(|&frame| frame < cutoff).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_matures_before_frames_in_flight() {
        let queued = [10u64, 10, 11];
        assert_eq!(ready_count(queued.iter().copied(), 10, 2), 0);
        assert_eq!(ready_count(queued.iter().copied(), 12, 2), 0);
    }

    #[test]
    fn prefix_matures_in_order() {
        let queued = [10u64, 10, 11, 14];
        assert_eq!(ready_count(queued.iter().copied(), 13, 2), 2);
        assert_eq!(ready_count(queued.iter().copied(), 14, 2), 3);
        assert_eq!(ready_count(queued.iter().copied(), 100, 2), 4);
    }
}
