use anyhow::Result;

use crate::detect::result::DetectionOutput;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend owns whatever per-session state inference needs. Sessions never
/// share a backend instance: each one gets its own from the registry, so
/// `detect` may take `&mut self` without any locking.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Returns the frame to show (annotated, or a copy of the input when
    /// nothing was found) and the detections in the order the backend ranks
    /// them.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
