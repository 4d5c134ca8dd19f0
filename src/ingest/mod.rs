//! Frame ingestion sources.
//!
//! This module provides the sources a streaming session can pull frames from:
//! - Cameras: V4L2 devices (feature: ingest-v4l2) or `stub://` synthetic cameras
//! - Local files: concatenated-JPEG `.mjpg` files, other containers via FFmpeg
//!   (feature: ingest-file-ffmpeg), or `stub://` synthetic clips
//!
//! Every source yields RGB24 `Frame`s of a fixed size. `Ok(None)` from
//! `next_frame` is the end of the stream, not an error. Dropping a source
//! releases the underlying device or file handle.

mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use std::fmt;

pub use camera::{CameraConfig, CameraSource};
pub use file::{FileConfig, FileSource};

use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

/// Pull-based frame source owned by exactly one session.
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` means the stream is exhausted.
    fn next_frame(&mut self) -> StreamResult<Option<Frame>>;

    /// Live sources deliver frames at device rate and are never paced.
    fn is_live(&self) -> bool;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    fn stats(&self) -> SourceStats;

    /// Release the device or file early. Also happens on drop.
    fn close(&mut self) {}
}

/// Frame counters for a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub origin: String,
}

/// Where a session reads its frames from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Camera device path (`/dev/video0`) or `stub://` camera.
    Device(String),
    /// Local video file path or `stub://` clip.
    File(String),
}

impl SourceOrigin {
    /// Build a device origin. A bare index such as `"1"` maps to `/dev/video1`.
    pub fn device(device: &str) -> Self {
        let device = device.trim();
        if !device.is_empty() && device.chars().all(|c| c.is_ascii_digit()) {
            SourceOrigin::Device(format!("/dev/video{device}"))
        } else {
            SourceOrigin::Device(device.to_string())
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        SourceOrigin::File(path.into())
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SourceOrigin::Device(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceOrigin::Device(path) | SourceOrigin::File(path) => path,
        }
    }
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOrigin::Device(path) => write!(f, "device:{path}"),
            SourceOrigin::File(path) => write!(f, "file:{path}"),
        }
    }
}

/// Preferred capture geometry and rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

/// Open and connect the source for `origin`.
///
/// Any failure to open or connect is reported as `SourceUnavailable`; no
/// retry is attempted.
pub fn open_source(
    origin: &SourceOrigin,
    capture: &CaptureSettings,
) -> StreamResult<Box<dyn FrameSource>> {
    let unavailable =
        |err: anyhow::Error| StreamError::source_unavailable(origin.to_string(), format!("{err:#}"));
    match origin {
        SourceOrigin::Device(device) => {
            let mut source = CameraSource::new(CameraConfig {
                device: device.clone(),
                target_fps: capture.target_fps,
                width: capture.width,
                height: capture.height,
            })
            .map_err(unavailable)?;
            source.connect().map_err(unavailable)?;
            Ok(Box::new(source))
        }
        SourceOrigin::File(path) => {
            let mut source = FileSource::new(FileConfig {
                path: path.clone(),
                target_fps: capture.target_fps,
            })
            .map_err(|err| match err.downcast::<StreamError>() {
                Ok(typed @ StreamError::UnsupportedFormat { .. }) => typed,
                Ok(other) => unavailable(other.into()),
                Err(err) => unavailable(err),
            })?;
            source.connect().map_err(unavailable)?;
            Ok(Box::new(source))
        }
    }
}
