//! Wires capture, processing and the frame slot together.

use crate::capture::{BackendOpener, CaptureError, CaptureSource};
use crate::processing::{FrameProcessor, ProcessingMode, SharedMode};
use crate::slot::FrameSlot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-frame outcome counters, updated on the capture thread.
#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub frames_processed: u64,
    pub frames_failed: u64,
}

/// Owns the active processing mode and the capture source, and publishes
/// every successfully processed frame into the shared slot.
///
/// The render side only ever sees the slot; it can outlive `stop()` and be
/// drained by a pipeline built after a surface is recreated.
pub struct Orchestrator {
    mode: SharedMode,
    slot: Arc<FrameSlot>,
    processor: FrameProcessor,
    capture: CaptureSource,
    counters: Arc<Counters>,
}

impl Orchestrator {
    pub fn new(opener: BackendOpener, processor: FrameProcessor, initial_mode: ProcessingMode, max_consecutive_errors: u32) -> Self {
        Self {
            mode: SharedMode::new(initial_mode),
            slot: Arc::new(FrameSlot::new()),
            processor,
            capture: CaptureSource::new(opener, max_consecutive_errors),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Takes effect for the next frame whose processing starts after this call.
    pub fn set_processing_mode(&self, mode: ProcessingMode) {
        let previous = self.mode.get();
        self.mode.set(mode);
        if previous != mode {
            info!("Processing mode: {} -> {}", previous, mode);
        }
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.mode.get()
    }

    /// Starts capture. Calling this while running is a no-op; after a capture
    /// failure it reopens the device.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.capture.is_running() {
            debug!("Orchestrator already running");
            return Ok(());
        }

        let mode = self.mode.clone();
        let processor = self.processor.clone();
        let slot = self.slot.clone();
        let counters = self.counters.clone();

        self.capture.start(move |raw| {
            // One snapshot per frame; a concurrent mode change applies to the next one.
            let mode = mode.get();
            let (width, height) = (raw.width, raw.height);
            match processor.process(raw, mode) {
                Ok(frame) => {
                    slot.publish(frame);
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping {}x{} frame ({}): {}", width, height, mode, e);
                }
            }
        })
    }

    /// Stops capture and releases the camera. The slot and anything rendering
    /// from it are left alone. Idempotent.
    pub fn stop(&mut self) {
        self.capture.stop();
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.capture.frame_size()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            frames_processed: self.counters.processed.load(Ordering::Relaxed),
            frames_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Handle for the render side.
    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }
}
