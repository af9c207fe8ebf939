//! Single-slot hand-off between the capture thread and the render thread.
//!
//! The slot holds at most one processed frame. Publishing replaces whatever is
//! pending, so the consumer always sees the newest frame and memory stays
//! bounded to one frame no matter how far the renderer falls behind.

use crate::frame::ProcessedFrame;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counters describing slot traffic since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Frames handed to `publish`
    pub published: u64,
    /// Frames replaced before anyone drained them
    pub dropped: u64,
    /// Frames taken by `drain_if_dirty`
    pub drained: u64,
}

#[derive(Default)]
struct SlotState {
    // Some(..) is the dirty state.
    pending: Option<ProcessedFrame>,
    stats: SlotStats,
}

/// Mutex-guarded mailbox with overwrite-on-publish semantics.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    // The critical sections only move an Option, so a panic while the lock is
    // held cannot leave a half-written frame behind.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `frame` as the pending frame, discarding any undrained one.
    pub fn publish(&self, frame: ProcessedFrame) {
        let replaced = {
            let mut state = self.lock();
            state.stats.published += 1;
            let replaced = state.pending.replace(frame);
            if replaced.is_some() {
                state.stats.dropped += 1;
            }
            replaced
        };
        // Free the discarded buffer outside the lock.
        drop(replaced);
    }

    /// Takes the pending frame, if any. Never allocates and never blocks
    /// beyond the short critical section.
    pub fn drain_if_dirty(&self) -> Option<ProcessedFrame> {
        let mut state = self.lock();
        let frame = state.pending.take();
        if frame.is_some() {
            state.stats.drained += 1;
        }
        frame
    }

    /// True while a published frame is waiting to be drained.
    pub fn is_dirty(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn stats(&self) -> SlotStats {
        self.lock().stats
    }
}
