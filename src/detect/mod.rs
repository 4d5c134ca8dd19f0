mod annotate;
mod backend;
mod backends;
mod registry;
mod result;

pub use annotate::{annotate, class_color};
pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, YoloParams};
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{non_max_suppression, BoundingBox, Detection, DetectionOutput};
