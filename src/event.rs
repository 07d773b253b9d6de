//! Canonical detection events.
//!
//! One `DetectionEvent` is produced per processed frame. Events are
//! append-only: once formatted they are pushed to the sink and never mutated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::Detection;
use crate::frame::ImageSize;

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("frame id must be at least 1")]
    InvalidFrameId,

    #[error("image size {width}x{height} must be positive")]
    InvalidImageSize { width: u32, height: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// 1-based, increasing by one per processed frame.
    pub frame_id: u64,
    /// ISO-8601 processing time.
    pub timestamp: String,
    pub image_size: ImageSize,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
    pub session_id: String,
}

/// Formats raw per-frame detections for one session.
#[derive(Clone, Debug)]
pub struct EventFormatter {
    session_id: String,
}

impl EventFormatter {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn format(
        &self,
        frame_id: u64,
        timestamp: impl Into<String>,
        detections: Vec<Detection>,
        image_size: ImageSize,
    ) -> Result<DetectionEvent, FormatError> {
        if frame_id < 1 {
            return Err(FormatError::InvalidFrameId);
        }
        if !image_size.is_positive() {
            return Err(FormatError::InvalidImageSize {
                width: image_size.width,
                height: image_size.height,
            });
        }
        Ok(DetectionEvent {
            frame_id,
            timestamp: timestamp.into(),
            image_size,
            detection_count: detections.len(),
            detections,
            session_id: self.session_id.clone(),
        })
    }
}

/// One-line summary of an event for logs.
pub fn summary(event: &DetectionEvent) -> String {
    let items: Vec<String> = event
        .detections
        .iter()
        .map(|d| format!("{} {:.1}%", d.class_name, d.confidence * 100.0))
        .collect();
    format!(
        "frame {} at {}: {} detection(s) [{}]",
        event.frame_id,
        event.timestamp,
        event.detection_count,
        items.join(", ")
    )
}
