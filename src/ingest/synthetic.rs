use crate::frame::{Frame, ImageSize};

use super::{SourceError, SyntheticSpec};

/// Deterministic frame generator behind `stub://` references.
///
/// Frames are a position/sequence pattern; the scene shifts every 50 frames
/// so pixel content is not constant across a long run.
pub(crate) struct SyntheticFrames {
    spec: SyntheticSpec,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticFrames {
    pub(crate) fn new(spec: SyntheticSpec) -> Self {
        Self {
            spec,
            frame_count: 0,
            scene_state: 0,
        }
    }

    pub(crate) fn spec(&self) -> &SyntheticSpec {
        &self.spec
    }

    pub(crate) fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Next frame, or `None` once a finite clip is exhausted.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if let Some(limit) = self.spec.frames {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        if !self.spec.delay.is_zero() {
            std::thread::sleep(self.spec.delay);
        }

        self.frame_count += 1;
        let pixels = self.generate_pixels()?;
        Frame::new(pixels, self.spec.width, self.spec.height, self.frame_count)
            .map(Some)
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>, SourceError> {
        let len = ImageSize::new(self.spec.width, self.spec.height)
            .rgb_len()
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        Ok(pixels)
    }
}
