//! Frame ingestion sources.
//!
//! This module turns a video reference into a sequential provider of frames:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Live cameras (feature: ingest-v4l2)
//! - Synthetic `stub://` sources (finite clips or live streams, for tests)
//!
//! All sources produce `Frame` instances normalized to RGB24. A file source is
//! finite and reports progress as a percentage; a live source is unbounded and
//! reports progress as `-1.0` ("undefined").
//!
//! End of stream is `Ok(None)` from `read_frame`. Live sources never report
//! end of stream: a device that stops delivering frames is an error.

pub mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod synthetic;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::frame::Frame;

pub use camera::CameraSource;
pub use file::FileSource;

/// Container extensions accepted for file sources.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video reference is invalid: {0}")]
    InvalidReference(String),

    #[error("video source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("video source could not be decoded: {0}")]
    UnreadableFormat(String),

    #[error("capture device failure: {0}")]
    Device(String),

    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Parameters of a synthetic `stub://` source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSpec {
    pub name: String,
    /// Number of frames before end of stream. `None` makes the source live.
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    /// Pause before each frame, to emulate capture pacing.
    pub delay: Duration,
}

/// A parsed video reference.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceRef {
    File(PathBuf),
    /// Capture device path (e.g., "/dev/video0").
    Camera(String),
    Synthetic(SyntheticSpec),
}

impl SourceRef {
    /// Parse a caller-supplied reference.
    ///
    /// Accepted forms: a local file path with an accepted extension,
    /// `camera:N`, `/dev/videoN`, or
    /// `stub://name?frames=N&width=W&height=H&delay_ms=D`.
    pub fn parse(reference: &str) -> Result<Self, SourceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SourceError::InvalidReference(
                "no video reference provided".to_string(),
            ));
        }
        if reference.starts_with("stub://") {
            return parse_synthetic(reference).map(SourceRef::Synthetic);
        }
        if let Some(index) = reference.strip_prefix("camera:") {
            let index: u32 = index.parse().map_err(|_| {
                SourceError::InvalidReference(format!("camera index '{}' is not a number", index))
            })?;
            return Ok(SourceRef::Camera(format!("/dev/video{}", index)));
        }
        if reference.starts_with("/dev/video") {
            return Ok(SourceRef::Camera(reference.to_string()));
        }
        if reference.contains("://") {
            return Err(SourceError::InvalidReference(
                "only local paths are supported (no URL schemes)".to_string(),
            ));
        }

        let path = PathBuf::from(reference);
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension {
            Some(ext) if ACCEPTED_EXTENSIONS.contains(&ext.as_str()) => Ok(SourceRef::File(path)),
            _ => Err(SourceError::InvalidReference(format!(
                "unsupported video type for {} (accepted: {})",
                path.display(),
                ACCEPTED_EXTENSIONS.join(", ")
            ))),
        }
    }

    /// Check that the reference points at something that exists.
    pub fn validate(&self) -> Result<(), SourceError> {
        match self {
            SourceRef::File(path) => {
                if path.is_file() {
                    Ok(())
                } else {
                    Err(SourceError::NotFound(path.clone()))
                }
            }
            SourceRef::Camera(device) => {
                if Path::new(device).exists() {
                    Ok(())
                } else {
                    Err(SourceError::NotFound(PathBuf::from(device)))
                }
            }
            SourceRef::Synthetic(_) => Ok(()),
        }
    }

    /// Short name reported as `video_name` in job status.
    pub fn display_name(&self) -> String {
        match self {
            SourceRef::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            SourceRef::Camera(device) => device.clone(),
            SourceRef::Synthetic(spec) => format!("stub://{}", spec.name),
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            SourceRef::File(_) => false,
            SourceRef::Camera(_) => true,
            SourceRef::Synthetic(spec) => spec.frames.is_none(),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::File(path) => write!(f, "{}", path.display()),
            SourceRef::Camera(device) => write!(f, "{}", device),
            SourceRef::Synthetic(spec) => {
                write!(
                    f,
                    "stub://{}?width={}&height={}",
                    spec.name, spec.width, spec.height
                )?;
                if let Some(frames) = spec.frames {
                    write!(f, "&frames={}", frames)?;
                }
                if !spec.delay.is_zero() {
                    write!(f, "&delay_ms={}", spec.delay.as_millis())?;
                }
                Ok(())
            }
        }
    }
}

/// Sequential provider of frames.
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Percentage of the stream consumed, in `[0, 100]`, or `-1.0` when the
    /// total is unknown (live sources).
    fn progress(&self) -> f64 {
        progress_percent(self.frames_read(), self.total_frames())
    }

    /// Total frame count when known. Live sources return `None`.
    fn total_frames(&self) -> Option<u64>;

    /// Frames returned so far.
    fn frames_read(&self) -> u64;

    fn is_live(&self) -> bool;

    /// Release the underlying resources. Safe to call more than once.
    fn close(&mut self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Open a frame source for a parsed reference.
pub fn open_source(reference: &SourceRef) -> Result<Box<dyn FrameSource>, SourceError> {
    match reference {
        SourceRef::File(path) => Ok(Box::new(FileSource::open(path)?)),
        SourceRef::Camera(device) => Ok(Box::new(CameraSource::open_device(device)?)),
        SourceRef::Synthetic(spec) if spec.frames.is_some() => {
            Ok(Box::new(FileSource::synthetic(spec.clone())))
        }
        SourceRef::Synthetic(spec) => Ok(Box::new(CameraSource::synthetic(spec.clone()))),
    }
}

/// An empty finite stream is already fully consumed.
pub(crate) fn progress_percent(frames_read: u64, total: Option<u64>) -> f64 {
    match total {
        Some(0) => 100.0,
        Some(total) => ((frames_read as f64 / total as f64) * 100.0).min(100.0),
        None => -1.0,
    }
}

fn parse_synthetic(reference: &str) -> Result<SyntheticSpec, SourceError> {
    let url = Url::parse(reference)
        .map_err(|e| SourceError::InvalidReference(format!("{}: {}", reference, e)))?;
    let name = url
        .host_str()
        .filter(|host| !host.is_empty())
        .unwrap_or("stub")
        .to_string();
    let mut spec = SyntheticSpec {
        name,
        frames: None,
        width: DEFAULT_SYNTHETIC_WIDTH,
        height: DEFAULT_SYNTHETIC_HEIGHT,
        delay: Duration::ZERO,
    };
    for (key, value) in url.query_pairs() {
        let parsed: u64 = value.parse().map_err(|_| {
            SourceError::InvalidReference(format!("{}={} is not a number", key, value))
        })?;
        match key.as_ref() {
            "frames" => spec.frames = Some(parsed),
            "width" => spec.width = dimension(&key, parsed)?,
            "height" => spec.height = dimension(&key, parsed)?,
            "delay_ms" => spec.delay = Duration::from_millis(parsed),
            other => {
                return Err(SourceError::InvalidReference(format!(
                    "unknown stub parameter '{}'",
                    other
                )))
            }
        }
    }
    Ok(spec)
}

fn dimension(key: &str, value: u64) -> Result<u32, SourceError> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(SourceError::InvalidReference(format!(
            "{} must be a positive 32-bit value",
            key
        ))),
    }
}
