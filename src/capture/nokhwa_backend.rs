//! Nokhwa-based webcam capture backend.

use super::{CameraInfo, CaptureBackend, CaptureConfig, CaptureError};
use crate::frame::{PixelFormat, RawFrame};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use tracing::{debug, info, warn};

/// Fallback resolutions tried after the configured one, largest first.
const FALLBACK_RESOLUTIONS: [(u32, u32); 3] = [(1920, 1080), (1280, 720), (640, 480)];

/// Stream encodings in order of preference.
const FRAME_FORMATS: [FrameFormat; 3] = [FrameFormat::NV12, FrameFormat::YUYV, FrameFormat::MJPEG];

/// Webcam capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

impl NokhwaCapture {
    /// Seed formats to probe, starting with the configured size and rate.
    fn seed_formats(config: &CaptureConfig) -> Vec<CameraFormat> {
        let mut resolutions = vec![(config.width, config.height)];
        resolutions.extend(FALLBACK_RESOLUTIONS.iter().copied().filter(|r| *r != (config.width, config.height)));

        let mut rates = vec![config.fps];
        rates.extend([30, 15].into_iter().filter(|fps| *fps != config.fps));

        let mut seeds = Vec::new();
        for (width, height) in resolutions {
            for &fps in &rates {
                for format in FRAME_FORMATS {
                    seeds.push(CameraFormat::new(Resolution::new(width, height), format, fps));
                }
            }
        }
        seeds
    }
}

/// Stream encodings the frame adapter converts itself.
fn native_pixel_format(format: FrameFormat) -> Option<PixelFormat> {
    match format {
        FrameFormat::YUYV => Some(PixelFormat::Yuyv),
        FrameFormat::NV12 => Some(PixelFormat::Nv12),
        _ => None,
    }
}

impl CaptureBackend for NokhwaCapture {
    fn list_devices() -> Result<Vec<CameraInfo>, CaptureError> {
        let devices = nokhwa::query(ApiBackend::Auto).map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        // Some drivers reject "Closest" unless the hint is roughly supported, and
        // creating the Camera is not proof the stream opens, so probe each seed.
        let mut camera = None;
        for seed in Self::seed_formats(&config) {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            if let Ok(mut cam) = Camera::new(CameraIndex::Index(config.device_index), requested) {
                if cam.open_stream().is_ok() {
                    info!("Verified connection with seed format: {:?}", seed);
                    camera = Some(cam);
                    break;
                }
                debug!("Seed format {:?} refused to stream", seed);
            }
        }

        let camera = camera.ok_or_else(|| {
            CaptureError::Unavailable(format!(
                "could not open a stream on camera index {} with any standard format",
                config.device_index
            ))
        })?;

        let resolution = camera.resolution();
        if (resolution.width(), resolution.height()) != (config.width, config.height) {
            warn!(
                "Requested {}x{}, camera negotiated {}",
                config.width, config.height, resolution
            );
        }
        info!("Camera opened with resolution: {}", resolution);

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }

    fn capture_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let frame = self.camera.frame().map_err(|e| CaptureError::Frame(e.to_string()))?;
        let resolution = frame.resolution();

        // Hand YUV straight to the processor; it converts once with ezk-image.
        if let Some(format) = native_pixel_format(frame.source_frame_format()) {
            let (width, height) = (resolution.width(), resolution.height());
            if frame.buffer().len() == format.frame_len(width, height) {
                self.width = width;
                self.height = height;
                return Ok(RawFrame::from_data(width, height, format, frame.buffer().to_vec()));
            }
            debug!(
                "{:?} buffer of {} bytes does not match {}, decoding to RGB",
                format,
                frame.buffer().len(),
                resolution
            );
        }

        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Frame(e.to_string()))?;

        // Decoded size wins over the negotiated one if the driver changed it.
        self.width = decoded.width();
        self.height = decoded.height();

        Ok(RawFrame::from_data(self.width, self.height, PixelFormat::Rgb, decoded.into_raw()))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for NokhwaCapture {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!("Failed to stop camera stream: {}", e);
        }
        debug!("Camera stream closed");
    }
}
