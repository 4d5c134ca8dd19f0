//! Frame container.
//!
//! A `Frame` is one decoded RGB24 image plus the sequence number its source
//! assigned to it. Frames are ephemeral: a session reads one, optionally hands
//! it to a detector, encodes the result and drops it before reading the next.
//!
//! Dimensions are fixed once a source is opened; every frame a source yields
//! has the same width and height.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// One decoded RGB24 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Source-assigned sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Wrap tightly-packed RGB24 bytes. The byte length must equal
    /// `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("failed to build {}x{} RGB image", width, height))?;
        Ok(Self { image, sequence })
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Raw RGB24 bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }
}
