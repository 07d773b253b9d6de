use anyhow::Result;

use crate::detect::result::Candidate;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend wraps one loaded model. It returns raw candidates in frame pixel
/// coordinates; thresholding, clamping and class naming are applied by the
/// `DetectionEngine` so every backend produces events of the same shape.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class names indexed by class id.
    fn class_names(&self) -> &[String];

    /// Run detection on a frame.
    ///
    /// Implementations must treat the frame as read-only and must not retain
    /// pixels beyond the call.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>>;

    /// Warm-up hook, called once on load with a blank frame.
    fn warm_up(&mut self, frame: &Frame) -> Result<()> {
        self.detect(frame).map(|_| ())
    }
}
