//! Decoded video frames.
//!
//! - `Frame`: RGB24 pixel buffer produced by a frame source, tagged with the
//!   sequence number the source assigned to it.
//! - `ImageSize`: frame dimensions as they appear in detection events.
//!
//! Frames are handed to the detection engine by reference and dropped once the
//! event for that frame has been formatted. Nothing downstream of the engine
//! ever sees pixels.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Bytes per pixel for the RGB24 layout every source normalizes to.
pub const RGB_CHANNELS: usize = 3;

/// Frame dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Expected RGB24 buffer length for these dimensions.
    pub fn rgb_len(&self) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))
    }
}

/// A decoded RGB24 frame.
///
/// `sequence` starts at 1 for the first frame a source yields. The synthetic
/// warm-up frame the engine builds on load uses sequence 0.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
}

impl Frame {
    /// Wrap a decoded buffer. Fails when the length does not match the
    /// dimensions or a dimension is zero.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let size = ImageSize::new(width, height);
        if !size.is_positive() {
            return Err(anyhow!("frame has zero dimension {}x{}", width, height));
        }
        let expected = size.rgb_len()?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
        })
    }

    /// All-black frame, used for model warm-up.
    pub fn blank(width: u32, height: u32) -> Result<Self> {
        let len = ImageSize::new(width, height).rgb_len()?;
        Self::new(vec![0u8; len], width, height, 0)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}
