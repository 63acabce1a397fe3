//! Still-image strategy: each frame becomes a standalone JPEG.

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use std::io::Cursor;

use super::{Codec, EncodedChunk};
use crate::error::EncoderError;
use crate::screen::FrameBuffer;

pub const NAME: &str = "jpeg";

pub struct JpegEncoder {
    frames: u64,
}

impl JpegEncoder {
    pub fn new() -> Self {
        Self { frames: 0 }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    pub fn encode(&mut self, frame: &FrameBuffer, quality: u8) -> Result<EncodedChunk, EncoderError> {
        let mut buf = Cursor::new(Vec::new());
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        encoder
            .encode(
                &frame.data,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| EncoderError::Encode(format!("JPEG encode failed: {}", e)))?;
        self.frames += 1;
        Ok(EncodedChunk {
            codec: Codec::Jpeg,
            data: buf.into_inner(),
        })
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_jpeg_markers() {
        let mut enc = JpegEncoder::new();
        let frame = FrameBuffer::filled(64, 48, [30, 60, 90]);
        let chunk = enc.encode(&frame, 90).unwrap();
        assert_eq!(chunk.codec, Codec::Jpeg);
        assert_eq!(&chunk.data[..2], &[0xFF, 0xD8]);
        assert_eq!(&chunk.data[chunk.data.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(enc.frames_encoded(), 1);
    }

    #[test]
    fn lower_quality_is_not_larger() {
        let mut enc = JpegEncoder::new();
        // Noisy frame so quality actually matters.
        let data: Vec<u8> = (0..128u32 * 128 * 3).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let frame = FrameBuffer::new(128, 128, data);
        let high = enc.encode(&frame, 95).unwrap();
        let low = enc.encode(&frame, 70).unwrap();
        assert!(low.data.len() <= high.data.len());
    }
}
