use serde::{Deserialize, Serialize};

use crate::frame::ImageSize;

/// Axis-aligned box in integer pixel coordinates, `x1 < x2` and `y1 < y2`,
/// inside the frame it was detected in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Clamp raw corner coordinates to the frame and truncate to pixels.
    ///
    /// Returns `None` when the clamped box has no area.
    pub fn clamped(x1: f32, y1: f32, x2: f32, y2: f32, size: ImageSize) -> Option<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return None;
        }
        let max_x = size.width as f32;
        let max_y = size.height as f32;
        let (x1, x2) = (x1.min(x2).clamp(0.0, max_x), x1.max(x2).clamp(0.0, max_x));
        let (y1, y2) = (y1.min(y2).clamp(0.0, max_y), y1.max(y2).clamp(0.0, max_y));
        let bbox = Self {
            x1: x1 as i32,
            y1: y1 as i32,
            x2: x2 as i32,
            y2: y2 as i32,
        };
        (bbox.x1 < bbox.x2 && bbox.y1 < bbox.y2).then_some(bbox)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// One located, classified object in a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Raw backend output, before thresholding, clamping and class naming.
///
/// Coordinates are corner pixels in the frame the backend was given.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: u32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}
