//! Continuous render loop consuming the frame slot.
//!
//! `RenderPipeline` owns the lifecycle and the once-per-tick drain/upload/draw
//! sequence; a `RenderBackend` owns the actual GPU objects.

mod gpu_context;
mod wgpu_backend;

pub use gpu_context::GpuContext;
pub use wgpu_backend::WgpuBackend;

use crate::frame::ProcessedFrame;
use crate::slot::FrameSlot;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Full-screen quad in clip space, triangle-strip order.
pub const QUAD_POSITIONS: [[f32; 2]; 4] = [
    [-1.0, -1.0], // bottom-left
    [1.0, -1.0],  // bottom-right
    [-1.0, 1.0],  // top-left
    [1.0, 1.0],   // top-right
];

/// Texture coordinates matching `QUAD_POSITIONS`, flipped vertically so row 0
/// of the frame lands at the top of the screen.
pub const QUAD_TEX_COORDS: [[f32; 2]; 4] = [
    [0.0, 1.0],
    [1.0, 1.0],
    [0.0, 0.0],
    [1.0, 0.0],
];

pub const QUAD_VERTEX_COUNT: u32 = QUAD_POSITIONS.len() as u32;

/// Lifecycle of a render pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    SurfaceReady,
    Rendering,
    TornDown,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    #[error("GPU device error: {0}")]
    Device(String),
    #[error("surface error: {0}")]
    Surface(String),
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: PipelineState },
    #[error("render pipeline used off the GPU thread")]
    WrongThread,
}

/// GPU-side operations the pipeline drives. All calls happen on the thread
/// that created the resources.
pub trait RenderBackend {
    /// Builds the shader program, sampler, quad geometry and initial texture.
    fn create_resources(&mut self) -> Result<(), RenderError>;

    /// Adapts the output surface and viewport to a new size.
    fn resize(&mut self, width: u32, height: u32);

    /// Dimensions of the current frame texture, if one exists.
    fn texture_size(&self) -> Option<(u32, u32)>;

    /// Replaces the frame texture with one of the given size.
    fn allocate_texture(&mut self, width: u32, height: u32) -> Result<(), RenderError>;

    /// Overwrites the whole texture with `frame`. Sizes already match.
    fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError>;

    /// Clears the target and draws the textured quad. Returns false when the
    /// surface had no image to present and the frame was skipped.
    fn draw(&mut self) -> Result<bool, RenderError>;

    /// Destroys all GPU resources.
    fn release(&mut self);
}

/// Counters for one pipeline's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub uploads: u64,
    pub draws: u64,
    pub skipped_draws: u64,
    pub skipped_uploads: u64,
    pub texture_allocations: u64,
}

pub struct RenderPipeline<B: RenderBackend> {
    backend: B,
    slot: Arc<FrameSlot>,
    state: PipelineState,
    owner: Option<ThreadId>,
    viewport: (u32, u32),
    stats: RenderStats,
}

impl<B: RenderBackend> RenderPipeline<B> {
    pub fn new(backend: B, slot: Arc<FrameSlot>) -> Self {
        Self {
            backend,
            slot,
            state: PipelineState::Uninitialized,
            owner: None,
            viewport: (0, 0),
            stats: RenderStats::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates GPU resources. A shader failure leaves the pipeline
    /// uninitialized and is returned to the caller.
    pub fn on_surface_created(&mut self) -> Result<(), RenderError> {
        if self.state != PipelineState::Uninitialized {
            return Err(RenderError::InvalidState {
                op: "on_surface_created",
                state: self.state,
            });
        }

        if let Err(e) = self.backend.create_resources() {
            error!("Render pipeline initialization failed: {}", e);
            self.backend.release();
            return Err(e);
        }
        if let Some((w, h)) = self.backend.texture_size() {
            debug!("Initial frame texture {}x{}", w, h);
        }

        self.owner = Some(thread::current().id());
        self.state = PipelineState::SurfaceReady;
        info!("Render pipeline ready");
        Ok(())
    }

    /// GPU calls must come from the thread that created the resources.
    fn check_owner(&self) -> Result<(), RenderError> {
        match self.owner {
            Some(owner) if owner != thread::current().id() => Err(RenderError::WrongThread),
            _ => Ok(()),
        }
    }

    /// Updates the viewport. No GPU resource is reallocated.
    pub fn on_surface_resized(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.check_owner()?;
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.viewport = (width, height);
        match self.state {
            PipelineState::SurfaceReady | PipelineState::Rendering => self.backend.resize(width, height),
            state => debug!("Resize to {}x{} recorded in state {}", width, height, state),
        }
        Ok(())
    }

    /// One iteration of the render loop: drain, upload if a frame arrived,
    /// then draw the quad with whatever the texture holds.
    pub fn on_render_tick(&mut self) -> Result<(), RenderError> {
        match self.state {
            PipelineState::SurfaceReady | PipelineState::Rendering => {}
            state => {
                return Err(RenderError::InvalidState {
                    op: "on_render_tick",
                    state,
                })
            }
        }
        if self.owner != Some(thread::current().id()) {
            return Err(RenderError::WrongThread);
        }

        if let Some(frame) = self.slot.drain_if_dirty() {
            self.upload_frame(&frame);
        }

        if self.backend.draw()? {
            self.stats.draws += 1;
            self.state = PipelineState::Rendering;
        } else {
            self.stats.skipped_draws += 1;
        }
        Ok(())
    }

    fn upload_frame(&mut self, frame: &ProcessedFrame) {
        if !frame.is_well_formed() {
            warn!(
                "Size mismatch: {}x{} frame carries {} bytes, expected {}; upload skipped",
                frame.width,
                frame.height,
                frame.data.len(),
                frame.expected_len()
            );
            self.stats.skipped_uploads += 1;
            return;
        }

        let size = (frame.width, frame.height);
        if self.backend.texture_size() != Some(size) {
            info!("Allocating frame texture {}x{}", size.0, size.1);
            if let Err(e) = self.backend.allocate_texture(size.0, size.1) {
                error!("Texture allocation failed: {}", e);
                self.stats.skipped_uploads += 1;
                return;
            }
            self.stats.texture_allocations += 1;
        }

        match self.backend.upload(frame) {
            Ok(()) => self.stats.uploads += 1,
            Err(e) => {
                error!("Texture upload failed: {}", e);
                self.stats.skipped_uploads += 1;
            }
        }
    }

    /// Releases GPU resources. The frame slot is left untouched.
    pub fn teardown(&mut self) -> Result<(), RenderError> {
        if self.state == PipelineState::TornDown {
            return Ok(());
        }
        self.check_owner()?;
        self.backend.release();
        self.owner = None;
        self.state = PipelineState::TornDown;
        info!(
            "Render pipeline torn down after {} draws, {} uploads",
            self.stats.draws, self.stats.uploads
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingBackend {
        fail_shader: bool,
        surface_lost: bool,
        created: bool,
        texture: Option<(u32, u32)>,
        uploads: Vec<(u32, u32, u8)>,
        draws: u32,
        resizes: Vec<(u32, u32)>,
        allocations: u32,
        released: bool,
    }

    impl RenderBackend for RecordingBackend {
        fn create_resources(&mut self) -> Result<(), RenderError> {
            if self.fail_shader {
                return Err(RenderError::ShaderCompile("syntax error".to_string()));
            }
            self.created = true;
            self.texture = Some((1, 1));
            Ok(())
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.resizes.push((width, height));
        }

        fn texture_size(&self) -> Option<(u32, u32)> {
            self.texture
        }

        fn allocate_texture(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
            self.allocations += 1;
            self.texture = Some((width, height));
            Ok(())
        }

        fn upload(&mut self, frame: &ProcessedFrame) -> Result<(), RenderError> {
            assert_eq!(self.texture, Some((frame.width, frame.height)));
            self.uploads.push((frame.width, frame.height, frame.data[0]));
            Ok(())
        }

        fn draw(&mut self) -> Result<bool, RenderError> {
            assert!(self.created);
            if self.surface_lost {
                return Ok(false);
            }
            self.draws += 1;
            Ok(true)
        }

        fn release(&mut self) {
            self.created = false;
            self.texture = None;
            self.released = true;
        }
    }

    fn ready_pipeline() -> (RenderPipeline<RecordingBackend>, Arc<FrameSlot>) {
        let slot = Arc::new(FrameSlot::new());
        let mut pipeline = RenderPipeline::new(RecordingBackend::default(), slot.clone());
        pipeline.on_surface_created().unwrap();
        (pipeline, slot)
    }

    #[test]
    fn test_quad_texcoords_are_flipped() {
        // bottom-left of the geometry samples the bottom-left of texture space (0, 1)
        assert_eq!(QUAD_POSITIONS[0], [-1.0, -1.0]);
        assert_eq!(QUAD_TEX_COORDS[0], [0.0, 1.0]);
        assert_eq!(QUAD_POSITIONS[3], [1.0, 1.0]);
        assert_eq!(QUAD_TEX_COORDS[3], [1.0, 0.0]);
        assert_eq!(QUAD_VERTEX_COUNT, 4);
    }

    #[test]
    fn test_tick_without_frame_draws_without_upload() {
        let (mut pipeline, slot) = ready_pipeline();
        slot.publish(ProcessedFrame::solid(4, 4, [9, 9, 9]));
        pipeline.on_render_tick().unwrap();
        let uploads_after_first = pipeline.backend().uploads.len();

        for _ in 0..3 {
            pipeline.on_render_tick().unwrap();
        }

        assert_eq!(uploads_after_first, 1);
        assert_eq!(pipeline.backend().uploads.len(), uploads_after_first);
        assert_eq!(pipeline.backend().draws, 4);
        assert_eq!(pipeline.state(), PipelineState::Rendering);
    }

    #[test]
    fn test_only_latest_frame_is_uploaded() {
        let (mut pipeline, slot) = ready_pipeline();
        slot.publish(ProcessedFrame::solid(64, 64, [255, 0, 0]));
        slot.publish(ProcessedFrame::solid(64, 64, [0, 0, 255]));

        pipeline.on_render_tick().unwrap();
        assert_eq!(pipeline.backend().uploads, vec![(64, 64, 0)]);
        assert_eq!(pipeline.stats().uploads, 1);
    }

    #[test]
    fn test_size_mismatch_skips_upload_but_still_draws() {
        let (mut pipeline, slot) = ready_pipeline();
        slot.publish(ProcessedFrame::from_data(4, 4, vec![0; 10]));

        pipeline.on_render_tick().unwrap();
        assert!(pipeline.backend().uploads.is_empty());
        assert_eq!(pipeline.backend().draws, 1);
        assert_eq!(pipeline.stats().skipped_uploads, 1);
    }

    #[test]
    fn test_texture_reallocated_only_on_dimension_change() {
        let (mut pipeline, slot) = ready_pipeline();
        for (w, h) in [(8, 8), (8, 8), (16, 4)] {
            slot.publish(ProcessedFrame::solid(w, h, [1, 1, 1]));
            pipeline.on_render_tick().unwrap();
        }

        assert_eq!(pipeline.backend().allocations, 2);
        assert_eq!(pipeline.backend().texture, Some((16, 4)));
        assert_eq!(pipeline.backend().uploads.len(), 3);
    }

    #[test]
    fn test_shader_failure_aborts_initialization() {
        let slot = Arc::new(FrameSlot::new());
        let backend = RecordingBackend {
            fail_shader: true,
            ..Default::default()
        };
        let mut pipeline = RenderPipeline::new(backend, slot);

        let err = pipeline.on_surface_created().unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompile(_)));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        assert!(matches!(
            pipeline.on_render_tick(),
            Err(RenderError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_resize_touches_viewport_only() {
        let (mut pipeline, _slot) = ready_pipeline();
        pipeline.on_surface_resized(800, 600).unwrap();
        pipeline.on_surface_resized(0, 600).unwrap();

        assert_eq!(pipeline.viewport(), (800, 600));
        assert_eq!(pipeline.backend().resizes, vec![(800, 600)]);
        assert_eq!(pipeline.backend().allocations, 0);
    }

    #[test]
    fn test_tick_from_other_thread_is_rejected() {
        let (pipeline, _slot) = ready_pipeline();
        let result = thread::spawn(move || {
            let mut pipeline = pipeline;
            pipeline.on_render_tick().map(|_| ())
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(RenderError::WrongThread)));
    }

    #[test]
    fn test_resize_and_teardown_from_other_thread_are_rejected() {
        let (pipeline, _slot) = ready_pipeline();
        let pipeline = thread::spawn(move || {
            let mut pipeline = pipeline;
            assert!(matches!(pipeline.on_surface_resized(640, 480), Err(RenderError::WrongThread)));
            assert!(matches!(pipeline.teardown(), Err(RenderError::WrongThread)));
            pipeline
        })
        .join()
        .unwrap();

        assert!(pipeline.backend().resizes.is_empty());
        assert!(!pipeline.backend().released);
        assert_eq!(pipeline.state(), PipelineState::SurfaceReady);
    }

    #[test]
    fn test_skipped_present_is_not_counted_as_draw() {
        let (mut pipeline, slot) = ready_pipeline();
        pipeline.backend.surface_lost = true;
        slot.publish(ProcessedFrame::solid(4, 4, [3, 3, 3]));

        pipeline.on_render_tick().unwrap();
        assert_eq!(pipeline.stats().draws, 0);
        assert_eq!(pipeline.stats().skipped_draws, 1);
        assert_eq!(pipeline.stats().uploads, 1);
        assert_eq!(pipeline.state(), PipelineState::SurfaceReady);

        pipeline.backend.surface_lost = false;
        pipeline.on_render_tick().unwrap();
        assert_eq!(pipeline.stats().draws, 1);
        assert_eq!(pipeline.state(), PipelineState::Rendering);
    }

    #[test]
    fn test_teardown_releases_and_keeps_slot() {
        let (mut pipeline, slot) = ready_pipeline();
        slot.publish(ProcessedFrame::solid(2, 2, [5, 5, 5]));
        pipeline.teardown().unwrap();
        pipeline.teardown().unwrap();

        assert_eq!(pipeline.state(), PipelineState::TornDown);
        assert!(pipeline.backend().released);
        assert!(slot.is_dirty());
        assert!(matches!(
            pipeline.on_render_tick(),
            Err(RenderError::InvalidState { .. })
        ));

        // A recreated surface gets a fresh pipeline over the same slot.
        let mut rebuilt = RenderPipeline::new(RecordingBackend::default(), slot.clone());
        rebuilt.on_surface_created().unwrap();
        rebuilt.on_render_tick().unwrap();
        assert_eq!(rebuilt.backend().uploads, vec![(2, 2, 5)]);
    }
}
