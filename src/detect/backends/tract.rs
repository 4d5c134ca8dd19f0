#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::annotate::annotate;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection, DetectionOutput};
use crate::frame::Frame;

type YoloPlan = TypedRunnableModel<TypedModel>;

/// Postprocessing knobs for YOLOv8-style models.
#[derive(Clone, Debug)]
pub struct YoloParams {
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    /// Class names by index; missing entries render as `class_<id>`.
    pub labels: Vec<String>,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.6,
            iou_threshold: 0.5,
            labels: Vec::new(),
        }
    }
}

impl YoloParams {
    /// Read labels from a text file, one per line.
    pub fn with_labels_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read labels file {}", path.display()))?;
        self.labels = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(self)
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

/// Tract-based backend for YOLOv8 ONNX detectors.
///
/// The optimized plan is immutable and shared between every instance built
/// from the same `load` call; each session still gets its own backend value.
pub struct TractBackend {
    model: Arc<YoloPlan>,
    params: Arc<YoloParams>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P, params: YoloParams) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = params.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model: Arc::new(model),
            params: Arc::new(params),
        })
    }

    /// Another backend sharing this one's model.
    pub fn share(&self) -> Self {
        Self {
            model: self.model.clone(),
            params: self.params.clone(),
        }
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let size = self.params.input_size;
        let resized = imageops::resize(frame.image(), size, size, FilterType::Triangle);
        let size = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    /// Decode a `[1, 4 + classes, anchors]` output into frame-space detections.
    fn decode(&self, output: &Tensor, frame_w: u32, frame_h: u32) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let sx = frame_w as f32 / self.params.input_size as f32;
        let sy = frame_h as f32 / self.params.input_size as f32;

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for row in 4..rows {
                let score = view[[0, row, anchor]];
                if score > best.1 {
                    best = (row - 4, score);
                }
            }
            let (class_id, score) = best;
            if score < self.params.conf_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(
                view[[0, 0, anchor]] * sx,
                view[[0, 1, anchor]] * sy,
                view[[0, 2, anchor]] * sx,
                view[[0, 3, anchor]] * sy,
            )
            .clamped(frame_w, frame_h);
            candidates.push(Detection::new(self.params.label(class_id), class_id, score, bbox));
        }

        Ok(non_max_suppression(candidates, self.params.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let detections = self.decode(output, frame.width(), frame.height())?;

        Ok(DetectionOutput {
            annotated: annotate(frame, &detections),
            detections,
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let size = self.params.input_size;
        let len = (size as usize)
            .checked_mul(size as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("model input size {} is too large", size))?;
        let blank = Frame::from_rgb(vec![0; len], size, size, 0)?;
        self.detect(&blank).map(|_| ())
    }
}
