//! Per-frame image processing.

mod cpu_transform;

pub use cpu_transform::CpuTransform;

use crate::frame::{FrameError, ProcessedFrame, RawFrame, RGB_BYTES_PER_PIXEL};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Which visual transform is applied to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ProcessingMode {
    /// Luma only, replicated to three channels
    #[default]
    Grayscale = 0,
    /// Canny-style edge map
    EdgeDetect = 1,
    /// Input returned unchanged
    Passthrough = 2,
}

impl ProcessingMode {
    /// Maps the wire value back to a mode. Unknown values fall back to passthrough.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessingMode::Grayscale,
            1 => ProcessingMode::EdgeDetect,
            _ => ProcessingMode::Passthrough,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingMode::Grayscale => "grayscale",
            ProcessingMode::EdgeDetect => "edge-detect",
            ProcessingMode::Passthrough => "passthrough",
        };
        f.write_str(name)
    }
}

/// Mode cell shared between the control surface and the capture thread.
#[derive(Debug, Clone, Default)]
pub struct SharedMode(Arc<AtomicU8>);

impl SharedMode {
    pub fn new(mode: ProcessingMode) -> Self {
        Self(Arc::new(AtomicU8::new(mode.as_u8())))
    }

    pub fn get(&self) -> ProcessingMode {
        ProcessingMode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: ProcessingMode) {
        self.0.store(mode.as_u8(), Ordering::Release);
    }
}

/// Failure reported by a transform implementation.
#[derive(Debug, Error)]
#[error("transform rejected input: {0}")]
pub struct TransformError(pub String);

/// The image transform behind the processing boundary.
///
/// Input is packed RGB of `width * height * 3` bytes; the output must use the
/// same layout. Implementations must not keep state between calls.
pub trait FrameTransform: Send + Sync {
    fn apply(&self, rgb: &[u8], width: u32, height: u32, mode: ProcessingMode) -> Result<Vec<u8>, TransformError>;
}

/// Why a frame could not be processed. The frame is dropped either way.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("transform returned {actual} bytes, expected {expected}")]
    OutputLength { expected: usize, actual: usize },
}

/// Validates raw frames, converts them to packed RGB and runs the transform.
#[derive(Clone)]
pub struct FrameProcessor {
    transform: Arc<dyn FrameTransform>,
}

impl FrameProcessor {
    pub fn new(transform: Arc<dyn FrameTransform>) -> Self {
        Self { transform }
    }

    /// Processor backed by the bundled CPU transform.
    pub fn cpu() -> Self {
        Self::new(Arc::new(CpuTransform::default()))
    }

    pub fn process(&self, raw: RawFrame, mode: ProcessingMode) -> Result<ProcessedFrame, ProcessingError> {
        let (width, height) = (raw.width, raw.height);
        if width == 0 || height == 0 {
            return Err(ProcessingError::InvalidDimensions { width, height });
        }

        let rgb = raw.into_rgb()?;
        let output = self.transform.apply(&rgb, width, height, mode)?;

        let expected = width as usize * height as usize * RGB_BYTES_PER_PIXEL;
        if output.len() != expected {
            return Err(ProcessingError::OutputLength {
                expected,
                actual: output.len(),
            });
        }

        Ok(ProcessedFrame::from_data(width, height, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTransform {
        calls: AtomicUsize,
    }

    impl FrameTransform for CountingTransform {
        fn apply(&self, rgb: &[u8], _width: u32, _height: u32, _mode: ProcessingMode) -> Result<Vec<u8>, TransformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(rgb.to_vec())
        }
    }

    struct ShortTransform;

    impl FrameTransform for ShortTransform {
        fn apply(&self, _rgb: &[u8], _width: u32, _height: u32, _mode: ProcessingMode) -> Result<Vec<u8>, TransformError> {
            Ok(vec![0; 5])
        }
    }

    struct RejectingTransform;

    impl FrameTransform for RejectingTransform {
        fn apply(&self, _rgb: &[u8], _width: u32, _height: u32, _mode: ProcessingMode) -> Result<Vec<u8>, TransformError> {
            Err(TransformError("unsupported format".into()))
        }
    }

    #[test]
    fn test_zero_sized_input_never_reaches_transform() {
        let transform = Arc::new(CountingTransform::default());
        let processor = FrameProcessor::new(transform.clone());

        for (w, h) in [(0, 4), (4, 0), (0, 0)] {
            let raw = RawFrame::from_data(w, h, PixelFormat::Rgb, Vec::new());
            let err = processor.process(raw, ProcessingMode::Grayscale).unwrap_err();
            assert!(matches!(err, ProcessingError::InvalidDimensions { .. }));
        }
        assert_eq!(transform.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_buffer_never_reaches_transform() {
        let transform = Arc::new(CountingTransform::default());
        let processor = FrameProcessor::new(transform.clone());

        let raw = RawFrame::from_data(2, 2, PixelFormat::Rgba, vec![0; 7]);
        let err = processor.process(raw, ProcessingMode::Grayscale).unwrap_err();
        assert!(matches!(err, ProcessingError::Frame(FrameError::LengthMismatch { .. })));
        assert_eq!(transform.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_grayscale_2x2_keeps_dimensions() {
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let raw = RawFrame::from_data(2, 2, PixelFormat::Rgb, rgb);

        let frame = FrameProcessor::cpu().process(raw, ProcessingMode::Grayscale).unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.data.len(), 12);
        for px in frame.data.chunks_exact(3) {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
        assert_eq!(&frame.data[9..12], &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_camera_frame_is_converted_before_transform() {
        let transform = Arc::new(CountingTransform::default());
        let processor = FrameProcessor::new(transform.clone());

        // Neutral chroma, limited-range mid grey
        let yuyv = [126u8, 128, 126, 128].repeat(4);
        let raw = RawFrame::from_data(4, 2, PixelFormat::Yuyv, yuyv);
        let frame = processor.process(raw, ProcessingMode::Passthrough).unwrap();

        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        assert_eq!(transform.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transform_failure_is_reported() {
        let processor = FrameProcessor::new(Arc::new(RejectingTransform));
        let raw = RawFrame::from_data(1, 1, PixelFormat::Rgb, vec![1, 2, 3]);
        let err = processor.process(raw, ProcessingMode::EdgeDetect).unwrap_err();
        assert!(matches!(err, ProcessingError::Transform(_)));
    }

    #[test]
    fn test_wrong_output_length_is_reported() {
        let processor = FrameProcessor::new(Arc::new(ShortTransform));
        let raw = RawFrame::from_data(2, 2, PixelFormat::Rgb, vec![0; 12]);
        match processor.process(raw, ProcessingMode::Grayscale) {
            Err(ProcessingError::OutputLength { expected, actual }) => {
                assert_eq!(expected, 12);
                assert_eq!(actual, 5);
            }
            other => panic!("expected output length error, got {:?}", other.map(|f| f.data.len())),
        }
    }

    #[test]
    fn test_mode_wire_values() {
        for mode in [ProcessingMode::Grayscale, ProcessingMode::EdgeDetect, ProcessingMode::Passthrough] {
            assert_eq!(ProcessingMode::from_u8(mode.as_u8()), mode);
        }
        assert_eq!(ProcessingMode::from_u8(42), ProcessingMode::Passthrough);
    }

    #[test]
    fn test_shared_mode_is_visible_across_clones() {
        let mode = SharedMode::new(ProcessingMode::Grayscale);
        let other = mode.clone();
        other.set(ProcessingMode::EdgeDetect);
        assert_eq!(mode.get(), ProcessingMode::EdgeDetect);
    }
}
