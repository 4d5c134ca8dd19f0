//! Camera frame source.
//!
//! `CameraSource` captures from a local V4L2 device (feature: ingest-v4l2) or
//! from a synthetic `stub://` camera. Cameras are live: they deliver frames at
//! device rate and the session never paces them.

use anyhow::Result;

use super::synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
use super::v4l2::DeviceV4l2Source;
use super::{FrameSource, SourceStats};
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0") or `stub://` camera.
    pub device: String,
    /// Requested frame rate; drivers may round it.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Camera frame source.
pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if config.device.starts_with("stub://") {
            return Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticSource::from_url(
                    &config.device,
                    config.width,
                    config.height,
                    config.target_fps,
                    None,
                    true,
                )?),
            });
        }

        #[cfg(feature = "ingest-v4l2")]
        {
            Ok(Self {
                backend: CameraBackend::Device(DeviceV4l2Source::new(config)),
            })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(anyhow::anyhow!(
                "camera '{}' requires the ingest-v4l2 feature",
                config.device
            ))
        }
    }

    /// Open the device and start streaming buffers.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.connect(),
        }
    }

    /// Capture the next frame. `None` once a synthetic camera hits its limit.
    pub fn capture(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.next_frame().map(Some),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(_) => true,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.is_healthy(),
        }
    }

    fn counters(&self) -> SourceStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => SourceStats {
                frames_captured: source.frames_captured(),
                origin: source.origin().to_string(),
            },
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(source) => source.stats(),
        }
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
        self.capture().map_err(|err| {
            if !self.is_healthy() {
                log::warn!("CameraSource: {} unhealthy: {:#}", self.describe(), err);
            }
            StreamError::Read(format!("{err:#}"))
        })
    }

    fn is_live(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("device:{}", self.counters().origin)
    }

    fn stats(&self) -> SourceStats {
        self.counters()
    }

    fn close(&mut self) {
        #[cfg(feature = "ingest-v4l2")]
        {
            if let CameraBackend::Device(source) = &mut self.backend {
                source.disconnect();
            }
        }
    }
}
