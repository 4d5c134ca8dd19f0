//! Concatenated-JPEG (`.mjpg`) file decoder.
//!
//! The file is scanned for SOI/EOI marker pairs; each complete JPEG is decoded
//! to RGB24. Reaching the end of the file with no further complete image is
//! the end of the stream.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::fs::File;
use std::io::{BufReader, Read};

use super::file::FileStats;
use crate::frame::Frame;

/// Upper bound for a single JPEG inside the stream.
const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

pub(crate) struct MjpegFileSource {
    path: String,
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    frame_count: u64,
    size: Option<(u32, u32)>,
    exhausted: bool,
}

impl MjpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open mjpeg file {}", path))?;
        Ok(Self::from_reader(path, Box::new(BufReader::new(file))))
    }

    pub(crate) fn from_reader(path: &str, reader: Box<dyn Read + Send>) -> Self {
        Self {
            path: path.to_string(),
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            frame_count: 0,
            size: None,
            exhausted: false,
        }
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        log::info!("FileSource: connected to {} (mjpeg)", self.path);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(jpeg) = self.read_next_jpeg()? else {
            return Ok(None);
        };
        let (pixels, width, height) = decode_jpeg(&jpeg)?;
        match self.size {
            None => self.size = Some((width, height)),
            Some(size) if size != (width, height) => {
                return Err(anyhow!(
                    "mjpeg frame size changed from {}x{} to {}x{}",
                    size.0,
                    size.1,
                    width,
                    height
                ));
            }
            Some(_) => {}
        }
        self.frame_count += 1;
        Ok(Some(Frame::from_rgb(pixels, width, height, self.frame_count)?))
    }

    pub(crate) fn stats(&self) -> FileStats {
        FileStats {
            frames_captured: self.frame_count,
            path: self.path.clone(),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }
            if self.exhausted {
                return Ok(None);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                self.exhausted = true;
                continue;
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                return Err(anyhow!("mjpeg frame exceeded {} bytes", MAX_JPEG_BYTES));
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
