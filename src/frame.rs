//! Frame types exchanged between capture, processing and rendering.

use thiserror::Error;

/// Bytes per pixel of the packed RGB layout used for processing and upload.
pub const RGB_BYTES_PER_PIXEL: usize = 3;

/// Source pixel formats a capture backend may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
    /// BGRA with 8 bits per channel, as delivered by most preview surfaces
    Bgra,
    /// YUV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuyv,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
}

impl PixelFormat {
    /// Exact buffer length of a `width` x `height` image in this format.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let width = width as usize;
        let height = height as usize;
        match self {
            PixelFormat::Rgb => width * height * 3,
            PixelFormat::Rgba | PixelFormat::Bgra => width * height * 4,
            PixelFormat::Yuyv => width * height * 2,
            PixelFormat::Nv12 => {
                let uv_stride = width + (width % 2);
                let uv_height = height.div_ceil(2);
                width * height + uv_stride * uv_height
            }
        }
    }
}

/// Errors raised while interpreting frame buffers.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("buffer holds {actual} bytes, {format:?} {width}x{height} needs {expected}")]
    LengthMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("pixel conversion failed: {0}")]
    Conversion(String),
}

/// One unprocessed camera image.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of `data`
    pub format: PixelFormat,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Creates a raw frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Buffer length this frame should have for its declared format and size.
    pub fn expected_len(&self) -> usize {
        self.format.frame_len(self.width, self.height)
    }

    /// Checks that the buffer length matches the declared format and dimensions.
    pub fn check_len(&self) -> Result<(), FrameError> {
        let expected = self.expected_len();
        if self.data.len() != expected {
            return Err(FrameError::LengthMismatch {
                format: self.format,
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Converts the frame into packed RGB bytes, consuming it.
    ///
    /// RGB input is moved through untouched. Alpha is dropped and channels are
    /// reordered for the 32-bit formats; YUV formats go through ezk-image.
    pub fn into_rgb(self) -> Result<Vec<u8>, FrameError> {
        self.check_len()?;
        let pixel_count = self.width as usize * self.height as usize;

        match self.format {
            PixelFormat::Rgb => Ok(self.data),
            PixelFormat::Rgba => {
                let mut rgb = Vec::with_capacity(pixel_count * RGB_BYTES_PER_PIXEL);
                for px in self.data.chunks_exact(4) {
                    rgb.extend_from_slice(&[px[0], px[1], px[2]]);
                }
                Ok(rgb)
            }
            PixelFormat::Bgra => {
                let mut rgb = Vec::with_capacity(pixel_count * RGB_BYTES_PER_PIXEL);
                for px in self.data.chunks_exact(4) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
                Ok(rgb)
            }
            PixelFormat::Yuyv => yuv_to_rgb(ezk_image::PixelFormat::YUYV, &self.data, self.width, self.height),
            PixelFormat::Nv12 => yuv_to_rgb(ezk_image::PixelFormat::NV12, &self.data, self.width, self.height),
        }
    }
}

fn yuv_to_rgb(src_format: ezk_image::PixelFormat, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let width = width as usize;
    let height = height as usize;
    let mut rgb_data = vec![0u8; width * height * RGB_BYTES_PER_PIXEL];

    let dst_color = ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
    });
    let src_color = ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
        space: ezk_image::ColorSpace::BT709,
        full_range: false,
    });

    {
        let src_image = ezk_image::Image::from_buffer(src_format, data, None, width, height, src_color)
            .map_err(|e| FrameError::Conversion(format!("{:?}", e)))?;
        let mut dst_image = ezk_image::Image::from_buffer(
            ezk_image::PixelFormat::RGB,
            &mut rgb_data[..],
            None,
            width,
            height,
            dst_color,
        )
        .map_err(|e| FrameError::Conversion(format!("{:?}", e)))?;
        ezk_image::convert(&src_image, &mut dst_image).map_err(|e| FrameError::Conversion(format!("{:?}", e)))?;
    }

    Ok(rgb_data)
}

/// Output of the transform: packed RGB ready for texture upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Packed RGB pixel data, `width * height * 3` bytes
    pub data: Vec<u8>,
}

impl ProcessedFrame {
    /// Creates a processed frame from packed RGB data.
    pub fn from_data(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, data }
    }

    /// Creates a frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb.repeat(width as usize * height as usize);
        Self { width, height, data }
    }

    /// Number of bytes a frame of these dimensions must hold.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_BYTES_PER_PIXEL
    }

    /// True when the buffer length agrees with the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_to_rgb_drops_alpha() {
        let rgba = vec![255, 0, 0, 255, 0, 255, 0, 128, 0, 0, 255, 0, 255, 255, 255, 255];
        let frame = RawFrame::from_data(2, 2, PixelFormat::Rgba, rgba);
        let rgb = frame.into_rgb().unwrap();

        assert_eq!(rgb.len(), 12);
        assert_eq!(&rgb[0..3], &[255, 0, 0]);
        assert_eq!(&rgb[3..6], &[0, 255, 0]);
        assert_eq!(&rgb[9..12], &[255, 255, 255]);
    }

    #[test]
    fn test_bgra_channels_are_reordered() {
        let bgra = vec![10, 20, 30, 255];
        let frame = RawFrame::from_data(1, 1, PixelFormat::Bgra, bgra);
        assert_eq!(frame.into_rgb().unwrap(), vec![30, 20, 10]);
    }

    #[test]
    fn test_rgb_passes_through_without_copy() {
        let data = vec![1, 2, 3, 4, 5, 6];
        let ptr = data.as_ptr();
        let frame = RawFrame::from_data(2, 1, PixelFormat::Rgb, data);
        let rgb = frame.into_rgb().unwrap();
        assert_eq!(rgb.as_ptr(), ptr);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let frame = RawFrame::from_data(4, 4, PixelFormat::Rgba, vec![0; 10]);
        match frame.into_rgb() {
            Err(FrameError::LengthMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 64);
                assert_eq!(actual, 10);
            }
            other => panic!("expected length mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_nv12_len_accounts_for_odd_dimensions() {
        assert_eq!(PixelFormat::Nv12.frame_len(4, 4), 16 + 8);
        assert_eq!(PixelFormat::Nv12.frame_len(3, 3), 9 + 4 * 2);
    }

    #[test]
    fn test_yuyv_converts_to_rgb_size() {
        // Mid-grey in limited range: Y=126, U=V=128
        let yuyv = [126u8, 128, 126, 128].repeat(4);
        let frame = RawFrame::from_data(4, 2, PixelFormat::Yuyv, yuyv);
        let rgb = frame.into_rgb().unwrap();

        assert_eq!(rgb.len(), 4 * 2 * 3);
        for px in rgb.chunks_exact(3) {
            let spread = px.iter().max().unwrap() - px.iter().min().unwrap();
            assert!(spread <= 4, "neutral chroma should stay grey: {:?}", px);
        }
    }

    #[test]
    fn test_processed_frame_well_formed() {
        assert!(ProcessedFrame::solid(2, 2, [1, 2, 3]).is_well_formed());
        assert!(!ProcessedFrame::from_data(2, 2, vec![0; 11]).is_well_formed());
        assert!(!ProcessedFrame::from_data(0, 2, Vec::new()).is_well_formed());
    }
}
