//! Local file frame source.
//!
//! `FileSource` decodes frames from a local video file. The backend is chosen
//! from the path:
//! - `stub://...`: synthetic clip (300 frames unless `frames=` says otherwise)
//! - `*.mjpg` / `*.mjpeg`: concatenated JPEG stream, decoded in-process
//! - anything else: FFmpeg (feature: ingest-file-ffmpeg)
//!
//! Remote URLs are rejected; a missing file fails at construction time.

use anyhow::{anyhow, Result};
use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::mjpeg::MjpegFileSource;
use super::synthetic::SyntheticSource;
use super::{FrameSource, SourceStats};
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

/// Frames produced by a `stub://` clip without an explicit `frames=`.
const DEFAULT_STUB_CLIP_FRAMES: u64 = 300;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "uploads/flight.mp4").
    pub path: String,
    /// Nominal frame rate of the clip.
    pub target_fps: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            target_fps: 30,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    Mjpeg(MjpegFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        if config.path.starts_with("stub://") {
            return Ok(Self {
                backend: FileBackend::Synthetic(SyntheticSource::from_url(
                    &config.path,
                    640,
                    480,
                    config.target_fps,
                    Some(DEFAULT_STUB_CLIP_FRAMES),
                    false,
                )?),
            });
        }
        if !Path::new(&config.path).is_file() {
            return Err(anyhow!("file not found: {}", config.path));
        }
        if is_mjpeg_path(&config.path) {
            return Ok(Self {
                backend: FileBackend::Mjpeg(MjpegFileSource::open(&config.path)?),
            });
        }

        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(StreamError::UnsupportedFormat {
                origin: config.path,
                reason: "decoding requires the ingest-file-ffmpeg feature".to_string(),
            }
            .into())
        }
    }

    /// Connect to the file source.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            FileBackend::Mjpeg(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    /// Decode the next frame; `None` at end of file.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            FileBackend::Mjpeg(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    /// Get frame statistics.
    pub fn file_stats(&self) -> FileStats {
        match &self.backend {
            FileBackend::Synthetic(source) => FileStats {
                frames_captured: source.frames_captured(),
                path: source.origin().to_string(),
            },
            FileBackend::Mjpeg(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
        self.read_frame()
            .map_err(|err| StreamError::Read(format!("{err:#}")))
    }

    fn is_live(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("file:{}", self.file_stats().path)
    }

    fn stats(&self) -> SourceStats {
        let stats = self.file_stats();
        SourceStats {
            frames_captured: stats.frames_captured,
            origin: stats.path,
        }
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_captured: u64,
    pub path: String,
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

fn is_mjpeg_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mjpg") || ext.eq_ignore_ascii_case("mjpeg"))
        .unwrap_or(false)
}
