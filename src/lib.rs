//! detection-stream
//!
//! Runs an object detector over a video source (camera or file) and streams
//! the annotated frames to browsers as a `multipart/x-mixed-replace` JPEG
//! stream, next to a polling endpoint for the most recent detections.
//!
//! # Module Structure
//!
//! - `frame`: RGB frame container shared by every stage
//! - `ingest`: Frame sources (synthetic, MJPEG/video files, V4L2 cameras)
//! - `detect`: Detector backends, registry and box annotation
//! - `history`: Bounded, shared FIFO of recent detection records
//! - `encode`: JPEG encoding and multipart chunk framing
//! - `session`: Per-client streaming state machine
//! - `api`: Minimal HTTP server exposing the stream and history
//! - `config`: File + environment configuration for `streamd`

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod session;

pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectionOutput, DetectorBackend, StubBackend,
};
pub use encode::{StreamEncoder, MULTIPART_BOUNDARY, MULTIPART_CONTENT_TYPE};
pub use error::{StreamError, StreamResult};
pub use frame::Frame;
pub use history::{DetectionHistory, DetectionRecord, DEFAULT_HISTORY_CAPACITY};
pub use ingest::{open_source, CaptureSettings, FrameSource, SourceOrigin};
pub use session::{
    SessionEnd, SessionOptions, SessionReport, SessionState, StreamMode, StreamingSession,
};

/// Wall-clock seconds since the UNIX epoch, with sub-second precision.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
