//! Synthetic capture backend producing scrolling colour bars.
//!
//! Lets the full pipeline run without camera hardware. Frames are emitted as
//! BGRA, the layout most platform preview surfaces hand out.

use super::{CameraInfo, CaptureBackend, CaptureConfig, CaptureError};
use crate::frame::{PixelFormat, RawFrame};
use std::thread;
use std::time::{Duration, Instant};

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

pub struct TestPatternCapture {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_frame_at: Instant,
    frame_index: u64,
}

impl TestPatternCapture {
    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_width = w.div_ceil(BARS.len()).max(1);
        let offset = (self.frame_index as usize * 2) % w.max(1);

        let mut data = Vec::with_capacity(w * h * 4);
        for y in 0..h {
            // Darken the lower half so edges show up horizontally too.
            let shade = if y < h / 2 { 1 } else { 2 };
            for x in 0..w {
                let [r, g, b] = BARS[((x + offset) % w) / bar_width % BARS.len()];
                data.extend_from_slice(&[b / shade, g / shade, r / shade, 255]);
            }
        }
        data
    }
}

impl CaptureBackend for TestPatternCapture {
    fn list_devices() -> Result<Vec<CameraInfo>, CaptureError> {
        Ok(vec![CameraInfo {
            index: 0,
            name: "Test pattern".to_string(),
        }])
    }

    fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::Unavailable(format!(
                "test pattern needs a non-zero size, got {}x{}",
                config.width, config.height
            )));
        }
        let frame_interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
        Ok(Self {
            width: config.width,
            height: config.height,
            frame_interval,
            next_frame_at: Instant::now(),
            frame_index: 0,
        })
    }

    fn capture_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let now = Instant::now();
        if now < self.next_frame_at {
            thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + self.frame_interval;

        let data = self.render();
        self.frame_index += 1;

        Ok(RawFrame::from_data(self.width, self.height, PixelFormat::Bgra, data))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frames_are_well_formed_and_move() {
        let mut capture = TestPatternCapture::open(CaptureConfig {
            width: 16,
            height: 4,
            fps: 1000,
            ..Default::default()
        })
        .unwrap();

        let first = capture.capture_frame().unwrap();
        let second = capture.capture_frame().unwrap();

        assert_eq!(first.format, PixelFormat::Bgra);
        assert!(first.check_len().is_ok());
        assert_ne!(first.data, second.data);
        assert_eq!(capture.frame_index, 2);
    }

    #[test]
    fn test_pattern_rejects_zero_size() {
        let config = CaptureConfig {
            width: 0,
            ..Default::default()
        };
        assert!(TestPatternCapture::open(config).is_err());
    }
}
