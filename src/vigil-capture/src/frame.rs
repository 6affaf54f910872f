//! Decoded frame buffers

use base64::Engine;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage, RgbaImage};
use std::path::Path;

use crate::error::{CaptureError, Result};

/// Channel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb8,
    Rgba8,
}

impl PixelLayout {
    pub fn channels(&self) -> usize {
        match self {
            PixelLayout::Rgb8 => 3,
            PixelLayout::Rgba8 => 4,
        }
    }
}

/// Immutable decoded image together with its capture time
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap a raw pixel buffer, validating its size against the dimensions
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(layout.channels()))
            .ok_or_else(|| CaptureError::InvalidFrame(format!("{}x{} overflows", width, height)))?;

        if width == 0 || height == 0 || data.len() != expected {
            return Err(CaptureError::InvalidFrame(format!(
                "buffer of {} bytes does not match {}x{} {:?}",
                data.len(),
                width,
                height,
                layout
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            layout,
            captured_at,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    fn to_rgb_image(&self) -> Result<RgbImage> {
        let invalid = || CaptureError::InvalidFrame("buffer size mismatch".to_string());
        match self.layout {
            PixelLayout::Rgb8 => {
                RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(invalid)
            }
            PixelLayout::Rgba8 => {
                let rgba = RgbaImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(invalid)?;
                Ok(DynamicImage::ImageRgba8(rgba).to_rgb8())
            }
        }
    }

    /// Encode as JPEG (alpha is discarded)
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let img = self.to_rgb_image()?;
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&img)?;
        Ok(out)
    }

    /// JPEG encoded and wrapped in standard base64 for transport inside JSON
    pub fn encode_jpeg_base64(&self, quality: u8) -> Result<String> {
        let jpeg = self.encode_jpeg(quality)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }

    /// Save as JPEG file
    pub fn save_jpeg(&self, path: impl AsRef<Path>, quality: u8) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.encode_jpeg(quality)?)?;
        Ok(())
    }
}

/// File name used to identify a frame in logs and snapshot directories
pub fn snapshot_filename(captured_at: DateTime<Utc>) -> String {
    format!("frame_{}.jpg", captured_at.format("%Y%m%d_%H%M%S_%6f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn solid(width: u32, height: u32, layout: PixelLayout) -> Frame {
        let data = vec![128u8; (width * height) as usize * layout.channels()];
        Frame::new(data, width, height, layout, Utc::now()).unwrap()
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let err = Frame::new(vec![0; 10], 4, 4, PixelLayout::Rgb8, Utc::now());
        assert!(matches!(err, Err(CaptureError::InvalidFrame(_))));

        let err = Frame::new(Vec::new(), 0, 0, PixelLayout::Rgb8, Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn test_jpeg_encoding_produces_jpeg_magic() {
        for layout in [PixelLayout::Rgb8, PixelLayout::Rgba8] {
            let jpeg = solid(16, 8, layout).encode_jpeg(80).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn test_base64_is_decodable() {
        let encoded = solid(8, 8, PixelLayout::Rgb8).encode_jpeg_base64(80).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_snapshot_filename_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::microseconds(42);
        assert_eq!(snapshot_filename(ts), "frame_20240309_140507_000042.jpg");
    }
}
