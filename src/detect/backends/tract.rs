#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Candidate;
use crate::frame::Frame;

/// Square input edge of exported YOLOv8 models.
pub const MODEL_INPUT_SIZE: usize = 640;

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` with
/// `cx, cy, w, h` in model-input pixels followed by per-class scores. Frames
/// are stretched to the model input and boxes scaled back to frame pixels.
/// Class names come from a sidecar `<model>.names` file (one per line).
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    class_names: Vec<String>,
    score_floor: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let class_names = read_class_names(&names_path(model_path))?;
        Ok(Self {
            model,
            class_names,
            score_floor: 0.01,
        })
    }

    /// Drop candidates below this score before NMS.
    pub fn with_score_floor(mut self, floor: f32) -> Self {
        self.score_floor = floor;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let pixels = frame.pixels();
        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE),
            |(_, channel, y, x)| {
                let sx = x * src_w / MODEL_INPUT_SIZE;
                let sy = y * src_h / MODEL_INPUT_SIZE;
                pixels[(sy * src_w + sx) * 3 + channel] as f32 / 255.0
            },
        );
        input.into_tensor()
    }

    fn decode(&mut self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Candidate>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];
        if self.class_names.is_empty() {
            self.class_names = (0..classes).map(|i| format!("class_{}", i)).collect();
        }

        let scale_x = frame.width as f32 / MODEL_INPUT_SIZE as f32;
        let scale_y = frame.height as f32 / MODEL_INPUT_SIZE as f32;
        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (class_id, score) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, a]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.score_floor {
                continue;
            }
            let (cx, cy) = (view[[0, 0, a]], view[[0, 1, a]]);
            let (w, h) = (view[[0, 2, a]], view[[0, 3, a]]);
            candidates.push(Candidate {
                class_id: class_id as u32,
                confidence: score.min(1.0),
                x1: (cx - w / 2.0) * scale_x,
                y1: (cy - h / 2.0) * scale_y,
                x2: (cx + w / 2.0) * scale_x,
                y2: (cy + h / 2.0) * scale_y,
            });
        }
        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

fn names_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("names")
}

fn read_class_names(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        log::warn!(
            "TractBackend: no class names at {}, using numeric labels",
            path.display()
        );
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names {}", path.display()))?;
    Ok(raw
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect())
}

/// Greedy per-class NMS, highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(k, &candidate) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(class_id: u32, confidence: f32, x1: f32) -> Candidate {
        Candidate {
            class_id,
            confidence,
            x1,
            y1: 0.0,
            x2: x1 + 10.0,
            y2: 10.0,
        }
    }

    #[test]
    fn nms_suppresses_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![
                candidate(0, 0.6, 1.0),
                candidate(0, 0.9, 0.0),
                candidate(1, 0.5, 0.0),
                candidate(0, 0.7, 50.0),
            ],
            0.45,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
    }
}
