use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Edge of the blank square frame used for warm-up.
pub const WARMUP_FRAME_SIZE: u32 = 640;

/// Number of most recent latency samples kept for the running average.
pub const LATENCY_WINDOW: usize = 512;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("failed to load model: {0}")]
    LoadFailure(String),

    #[error("confidence threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
}

/// A loaded detection model with a normalized `predict` contract.
///
/// `predict` never fails: a backend error on one frame is logged and reported
/// as "no detections" so the stream keeps going.
pub struct DetectionEngine {
    backend: Box<dyn DetectorBackend>,
    confidence_threshold: f32,
    latencies_ms: VecDeque<f64>,
}

impl DetectionEngine {
    /// Load a model by reference.
    ///
    /// `stub://...` loads the (optionally scripted) stub backend. `.onnx` files load through tract
    /// (feature: backend-tract). Any other existing file is a load failure.
    pub fn load(model_ref: &str, confidence_threshold: f32) -> Result<Self, EngineError> {
        validate_threshold(confidence_threshold)?;
        if model_ref.starts_with("stub://") {
            let backend = StubBackend::from_reference(model_ref)
                .map_err(|e| EngineError::LoadFailure(format!("{:#}", e)))?;
            return Self::with_backend(Box::new(backend), confidence_threshold);
        }

        let path = check_model_path(model_ref)?;
        log::info!(
            "DetectionEngine: loading {} ({:.2} MB)",
            path.display(),
            std::fs::metadata(&path)
                .map(|m| m.len() as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0)
        );
        let backend = load_file_backend(&path)?;
        Self::with_backend(backend, confidence_threshold)
    }

    /// Wrap an already constructed backend and warm it up.
    pub fn with_backend(
        mut backend: Box<dyn DetectorBackend>,
        confidence_threshold: f32,
    ) -> Result<Self, EngineError> {
        validate_threshold(confidence_threshold)?;
        let blank = Frame::blank(WARMUP_FRAME_SIZE, WARMUP_FRAME_SIZE)
            .map_err(|e| EngineError::LoadFailure(e.to_string()))?;
        backend
            .warm_up(&blank)
            .map_err(|e| EngineError::LoadFailure(format!("warm-up failed: {:#}", e)))?;
        log::info!(
            "DetectionEngine: {} backend ready ({} classes, confidence threshold {:.0}%)",
            backend.name(),
            backend.class_names().len(),
            confidence_threshold * 100.0
        );
        Ok(Self {
            backend,
            confidence_threshold,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Run detection on one frame.
    pub fn predict(&mut self, frame: &Frame) -> Vec<Detection> {
        let started = Instant::now();
        let result = self.backend.detect(frame);
        self.record_latency(started.elapsed().as_secs_f64() * 1000.0);

        let candidates = match result {
            Ok(candidates) => candidates,
            Err(err) => {
                log::warn!(
                    "DetectionEngine: inference failed on frame {}: {:#}",
                    frame.sequence,
                    err
                );
                return Vec::new();
            }
        };

        let size = frame.size();
        let class_names = self.backend.class_names();
        candidates
            .into_iter()
            .filter(|c| c.confidence.is_finite() && c.confidence >= self.confidence_threshold)
            .filter_map(|c| {
                let bbox = BoundingBox::clamped(c.x1, c.y1, c.x2, c.y2, size)?;
                let class_name = class_names
                    .get(c.class_id as usize)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", c.class_id));
                Some(Detection {
                    class_id: c.class_id,
                    class_name,
                    confidence: c.confidence.min(1.0),
                    bbox,
                })
            })
            .collect()
    }

    /// Mean of the recorded latencies, 0 before any prediction.
    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    /// `1000 / average_latency_ms`, 0 before any prediction.
    pub fn estimated_fps(&self) -> f64 {
        let avg = self.average_latency_ms();
        if avg > 0.0 {
            1000.0 / avg
        } else {
            0.0
        }
    }

    pub fn samples(&self) -> usize {
        self.latencies_ms.len()
    }

    fn record_latency(&mut self, ms: f64) {
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        // A sub-resolution timing still counts as a sample.
        self.latencies_ms.push_back(ms.max(f64::MIN_POSITIVE));
    }
}

fn validate_threshold(threshold: f32) -> Result<(), EngineError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(EngineError::InvalidThreshold(threshold))
    }
}

/// Resolve a model reference to an existing file.
pub fn check_model_path(model_ref: &str) -> Result<PathBuf, EngineError> {
    let path = PathBuf::from(model_ref);
    if path.is_file() {
        Ok(path)
    } else {
        Err(EngineError::ModelNotFound(path))
    }
}

fn load_file_backend(path: &Path) -> Result<Box<dyn DetectorBackend>, EngineError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        #[cfg(feature = "backend-tract")]
        Some("onnx") => super::backends::TractBackend::new(path)
            .map(|backend| Box::new(backend) as Box<dyn DetectorBackend>)
            .map_err(|e| EngineError::LoadFailure(format!("{:#}", e))),
        #[cfg(not(feature = "backend-tract"))]
        Some("onnx") => Err(EngineError::LoadFailure(
            "ONNX models require the backend-tract feature".to_string(),
        )),
        _ => Err(EngineError::LoadFailure(format!(
            "unsupported model format: {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::Candidate;

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0u8; 100 * 50 * 3], 100, 50, sequence).unwrap()
    }

    fn candidate(class_id: u32, confidence: f32) -> Candidate {
        Candidate {
            class_id,
            confidence,
            x1: 10.0,
            y1: 10.0,
            x2: 200.0,
            y2: 40.0,
        }
    }

    #[test]
    fn fps_is_zero_before_first_prediction() {
        let engine = DetectionEngine::load("stub://model", 0.25).unwrap();
        assert_eq!(engine.samples(), 0);
        assert_eq!(engine.average_latency_ms(), 0.0);
        assert_eq!(engine.estimated_fps(), 0.0);
    }

    #[test]
    fn fps_is_positive_after_prediction() {
        let mut engine = DetectionEngine::load("stub://model", 0.25).unwrap();
        engine.predict(&frame(1));
        assert_eq!(engine.samples(), 1);
        assert!(engine.average_latency_ms() > 0.0);
        assert!(engine.estimated_fps() > 0.0);
    }

    #[test]
    fn predict_filters_clamps_and_names() {
        let backend = StubBackend::new()
            .with_detection(1, candidate(1, 0.8))
            .with_detection(1, candidate(2, 0.1))
            .with_detection(1, candidate(9, 0.9));
        let mut engine = DetectionEngine::with_backend(Box::new(backend), 0.25).unwrap();

        let detections = engine.predict(&frame(1));
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "Early Blight");
        assert_eq!(detections[0].bbox.x2, 100);
        assert_eq!(detections[1].class_name, "class_9");
    }

    #[test]
    fn backend_failure_degrades_to_empty() {
        let backend = StubBackend::new()
            .with_detection(2, candidate(1, 0.8))
            .failing_on(1);
        let mut engine = DetectionEngine::with_backend(Box::new(backend), 0.25).unwrap();
        assert!(engine.predict(&frame(1)).is_empty());
        assert_eq!(engine.predict(&frame(2)).len(), 1);
        assert_eq!(engine.samples(), 2);
    }

    #[test]
    fn warm_up_failure_is_load_failure() {
        let backend = StubBackend::new().failing_on(0);
        let err = DetectionEngine::with_backend(Box::new(backend), 0.25).err();
        assert!(matches!(err, Some(EngineError::LoadFailure(_))));
    }

    #[test]
    fn rejects_missing_model_and_bad_threshold() {
        assert!(matches!(
            DetectionEngine::load("/nonexistent/best.onnx", 0.25),
            Err(EngineError::ModelNotFound(_))
        ));
        assert!(matches!(
            DetectionEngine::load("stub://model", 1.5),
            Err(EngineError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn latency_window_is_bounded() {
        let mut engine = DetectionEngine::load("stub://model", 0.25).unwrap();
        for i in 0..(LATENCY_WINDOW as u64 + 20) {
            engine.predict(&frame(i + 1));
        }
        assert_eq!(engine.samples(), LATENCY_WINDOW);
    }
}
