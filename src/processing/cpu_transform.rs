//! Reference CPU transform: grayscale and Canny-style edge detection.

use super::{FrameTransform, ProcessingMode, TransformError};
use crate::frame::RGB_BYTES_PER_PIXEL;
use image::{GrayImage, ImageBuffer, Rgb};

/// Default hysteresis thresholds on the L1 Sobel magnitude.
const DEFAULT_LOW_THRESHOLD: i32 = 50;
const DEFAULT_HIGH_THRESHOLD: i32 = 150;

/// tan(22.5°) and tan(67.5°) scaled by 1000 for integer direction binning.
const TAN_22_5: i32 = 414;
const TAN_67_5: i32 = 2414;

/// Transform running entirely on the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct CpuTransform {
    pub low_threshold: i32,
    pub high_threshold: i32,
}

impl Default for CpuTransform {
    fn default() -> Self {
        Self {
            low_threshold: DEFAULT_LOW_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

impl FrameTransform for CpuTransform {
    fn apply(&self, rgb: &[u8], width: u32, height: u32, mode: ProcessingMode) -> Result<Vec<u8>, TransformError> {
        let view: ImageBuffer<Rgb<u8>, &[u8]> = ImageBuffer::from_raw(width, height, rgb).ok_or_else(|| {
            TransformError(format!(
                "{} bytes do not form a {}x{} RGB image",
                rgb.len(),
                width,
                height
            ))
        })?;

        match mode {
            ProcessingMode::Passthrough => Ok(rgb.to_vec()),
            ProcessingMode::Grayscale => {
                let gray = image::imageops::grayscale(&view);
                Ok(expand_gray(gray.as_raw()))
            }
            ProcessingMode::EdgeDetect => {
                let gray = image::imageops::grayscale(&view);
                let edges = self.detect_edges(&gray);
                Ok(expand_gray(&edges))
            }
        }
    }
}

impl CpuTransform {
    /// Sobel gradient, non-maximum suppression and hysteresis thresholding.
    /// Returns one byte per pixel, 255 on edges and 0 elsewhere.
    fn detect_edges(&self, gray: &GrayImage) -> Vec<u8> {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let px = |x: isize, y: isize| -> i32 {
            let cx = x.clamp(0, w as isize - 1) as u32;
            let cy = y.clamp(0, h as isize - 1) as u32;
            gray.get_pixel(cx, cy).0[0] as i32
        };

        let mut gx = vec![0i32; w * h];
        let mut gy = vec![0i32; w * h];
        let mut magnitude = vec![0i32; w * h];
        for y in 0..h as isize {
            for x in 0..w as isize {
                let dx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
                let dy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
                let i = y as usize * w + x as usize;
                gx[i] = dx;
                gy[i] = dy;
                magnitude[i] = dx.abs() + dy.abs();
            }
        }

        let mag_at = |x: isize, y: isize| -> i32 {
            if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
                0
            } else {
                magnitude[y as usize * w + x as usize]
            }
        };

        // 0 = suppressed, 1 = weak candidate, 2 = strong edge
        let mut class = vec![0u8; w * h];
        let mut stack = Vec::new();
        for y in 0..h as isize {
            for x in 0..w as isize {
                let i = y as usize * w + x as usize;
                let m = magnitude[i];
                if m <= self.low_threshold {
                    continue;
                }

                let (ax, ay) = (gx[i].abs(), gy[i].abs());
                let (prev, next) = if ay * 1000 <= ax * TAN_22_5 {
                    (mag_at(x - 1, y), mag_at(x + 1, y))
                } else if ay * 1000 >= ax * TAN_67_5 {
                    (mag_at(x, y - 1), mag_at(x, y + 1))
                } else if (gx[i] > 0) == (gy[i] > 0) {
                    (mag_at(x - 1, y - 1), mag_at(x + 1, y + 1))
                } else {
                    (mag_at(x + 1, y - 1), mag_at(x - 1, y + 1))
                };

                if m > prev && m >= next {
                    if m > self.high_threshold {
                        class[i] = 2;
                        stack.push((x, y));
                    } else {
                        class[i] = 1;
                    }
                }
            }
        }

        while let Some((x, y)) = stack.pop() {
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if class[n] == 1 {
                        class[n] = 2;
                        stack.push((nx, ny));
                    }
                }
            }
        }

        class.into_iter().map(|c| if c == 2 { 255 } else { 0 }).collect()
    }
}

fn expand_gray(gray: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(gray.len() * RGB_BYTES_PER_PIXEL);
    for &v in gray {
        rgb.extend_from_slice(&[v, v, v]);
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_edge(width: u32, height: u32) -> Vec<u8> {
        let mut rgb = Vec::new();
        for _ in 0..height {
            for x in 0..width {
                let v = if x < width / 2 { 0 } else { 255 };
                rgb.extend_from_slice(&[v, v, v]);
            }
        }
        rgb
    }

    #[test]
    fn test_grayscale_extremes() {
        let rgb = vec![0, 0, 0, 255, 255, 255];
        let out = CpuTransform::default().apply(&rgb, 2, 1, ProcessingMode::Grayscale).unwrap();
        assert_eq!(out, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_green_is_brighter_than_blue() {
        let rgb = vec![0, 255, 0, 0, 0, 255];
        let out = CpuTransform::default().apply(&rgb, 2, 1, ProcessingMode::Grayscale).unwrap();
        assert!(out[0] > out[3]);
    }

    #[test]
    fn test_edge_detect_marks_single_column_on_step() {
        let rgb = step_edge(8, 8);
        let out = CpuTransform::default().apply(&rgb, 8, 8, ProcessingMode::EdgeDetect).unwrap();
        assert_eq!(out.len(), 8 * 8 * 3);

        for y in 0..8 {
            let row: Vec<u8> = (0..8).map(|x| out[(y * 8 + x) * 3]).collect();
            assert_eq!(row.iter().filter(|&&v| v == 255).count(), 1, "row {}: {:?}", y, row);
            assert_eq!(row[0], 0);
            assert_eq!(row[7], 0);
        }
    }

    #[test]
    fn test_edge_detect_flat_image_is_black() {
        let rgb = vec![128u8; 6 * 6 * 3];
        let out = CpuTransform::default().apply(&rgb, 6, 6, ProcessingMode::EdgeDetect).unwrap();
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_passthrough_returns_input() {
        let rgb = vec![1, 2, 3, 4, 5, 6];
        let out = CpuTransform::default().apply(&rgb, 1, 2, ProcessingMode::Passthrough).unwrap();
        assert_eq!(out, rgb);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let err = CpuTransform::default().apply(&[0; 4], 2, 2, ProcessingMode::Grayscale);
        assert!(err.is_err());
    }
}
