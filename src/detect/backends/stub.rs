use anyhow::{anyhow, Result};

use crate::detect::annotate::annotate;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, DetectionOutput};
use crate::frame::Frame;

/// Stub backend for tests and model-less demos.
///
/// Without a script it reports one "object" in the middle of every frame.
/// A script is a list of per-frame detection sets, replayed in a loop.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    calls: u64,
    fail_every: Option<u64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the same detections on every frame.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self::scripted(vec![detections])
    }

    /// Replay `frames` in order, wrapping around at the end.
    pub fn scripted(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: frames,
            ..Self::default()
        }
    }

    /// Fail every `n`th call (1-based). `0` disables failures.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn centered(frame: &Frame) -> Vec<Detection> {
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        vec![Detection::new(
            "object",
            0,
            0.9,
            BoundingBox::new(w * 0.25, h * 0.25, w * 0.75, h * 0.75),
        )]
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput> {
        self.calls += 1;
        if let Some(n) = self.fail_every {
            if self.calls % n == 0 {
                return Err(anyhow!("stub failure on call {}", self.calls));
            }
        }

        let detections = if self.script.is_empty() {
            Self::centered(frame)
        } else {
            let index = ((self.calls - 1) % self.script.len() as u64) as usize;
            self.script[index].clone()
        };

        Ok(DetectionOutput {
            annotated: annotate(frame, &detections),
            detections,
        })
    }
}
