//! JPEG encoding and multipart chunk framing.
//!
//! Every emitted chunk is one self-delimited part of a
//! `multipart/x-mixed-replace` body:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JPEG>\r\n
//! ```

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Turns frames into multipart JPEG chunks.
#[derive(Clone, Copy, Debug)]
pub struct StreamEncoder {
    quality: u8,
}

impl StreamEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode_jpeg(&self, frame: &Frame) -> StreamResult<Vec<u8>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(StreamError::EncodeFailure(format!(
                "cannot encode empty {}x{} frame",
                frame.width(),
                frame.height()
            )));
        }
        let mut jpeg = Vec::with_capacity(frame.byte_len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(
                frame.pixels(),
                frame.width(),
                frame.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|err| StreamError::EncodeFailure(err.to_string()))?;
        Ok(jpeg)
    }

    /// Encode a frame and wrap it as one multipart part.
    pub fn encode_chunk(&self, frame: &Frame) -> StreamResult<Vec<u8>> {
        let jpeg = self.encode_jpeg(frame)?;
        Ok(wrap_part(&jpeg))
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

/// Frame an already-encoded JPEG as a multipart part.
pub fn wrap_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, 128]);
            }
        }
        Frame::from_rgb(data, width, height, 1).unwrap()
    }

    #[test]
    fn jpeg_has_soi_and_eoi_markers() {
        let jpeg = StreamEncoder::default()
            .encode_jpeg(&gradient_frame(16, 16))
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn encoded_jpeg_decodes_to_same_dimensions() {
        let jpeg = StreamEncoder::new(90)
            .encode_jpeg(&gradient_frame(24, 10))
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 10));
    }

    #[test]
    fn chunk_is_self_delimited() {
        let chunk = wrap_part(b"JPEGDATA");
        let text = String::from_utf8(chunk).unwrap();
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 8\r\n\r\nJPEGDATA\r\n"));
        assert!(text.ends_with("JPEGDATA\r\n"));
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(StreamEncoder::new(0).quality(), 1);
        assert_eq!(StreamEncoder::new(255).quality(), 100);
    }
}
