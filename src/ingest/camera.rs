//! Live camera frame source.
//!
//! `CameraSource` captures from a local V4L2 device (feature: ingest-v4l2) or
//! from a live synthetic `stub://` stream. Live sources are unbounded: there
//! is no total frame count and progress is always `-1.0`. A device that stops
//! producing frames surfaces as `SourceError::Device`.

#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;

use super::synthetic::SyntheticFrames;
use super::{FrameSource, SourceError, SyntheticSpec};
use crate::frame::Frame;

/// Preferred capture format for devices.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0").
    pub device: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Unbounded frame source.
pub struct CameraSource {
    description: String,
    backend: Option<CameraBackend>,
    frames_read: u64,
}

enum CameraBackend {
    Synthetic(SyntheticFrames),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceCamera),
}

impl CameraSource {
    /// Open a capture device with the default capture format.
    pub fn open_device(device: &str) -> Result<Self, SourceError> {
        Self::open(CameraConfig {
            device: device.to_string(),
            ..CameraConfig::default()
        })
    }

    pub fn open(config: CameraConfig) -> Result<Self, SourceError> {
        #[cfg(feature = "ingest-v4l2")]
        {
            let camera = DeviceCamera::connect(&config)?;
            Ok(Self {
                description: config.device.clone(),
                backend: Some(CameraBackend::Device(camera)),
                frames_read: 0,
            })
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(SourceError::UnreadableFormat(format!(
                "capturing from {} requires the ingest-v4l2 feature",
                config.device
            )))
        }
    }

    /// Live synthetic stream. `spec.frames` is ignored.
    pub fn synthetic(spec: SyntheticSpec) -> Self {
        let spec = SyntheticSpec {
            frames: None,
            ..spec
        };
        let description = format!("stub://{} (synthetic live)", spec.name);
        log::info!(
            "CameraSource: connected to {} ({}x{})",
            description,
            spec.width,
            spec.height
        );
        Self {
            description,
            backend: Some(CameraBackend::Synthetic(SyntheticFrames::new(spec))),
            frames_read: 0,
        }
    }
}

impl FrameSource for CameraSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let frame = match self.backend.as_mut() {
            None => {
                return Err(SourceError::Device(format!(
                    "{} has been released",
                    self.description
                )))
            }
            Some(CameraBackend::Synthetic(source)) => source.next_frame()?.ok_or_else(|| {
                SourceError::Device(format!(
                    "{} stopped after {} frames",
                    source.spec().name,
                    source.frame_count()
                ))
            })?,
            #[cfg(feature = "ingest-v4l2")]
            Some(CameraBackend::Device(camera)) => camera.next_frame()?,
        };
        self.frames_read += 1;
        Ok(Some(frame))
    }

    fn total_frames(&self) -> Option<u64> {
        None
    }

    fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn is_live(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "CameraSource: released {} (frames captured: {})",
                self.description,
                self.frames_read
            );
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// V4L2 device capture
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceCamera {
    state: DeviceState,
    device: String,
    frame_count: u64,
    width: u32,
    height: u32,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceCamera {
    fn connect(config: &CameraConfig) -> Result<Self, SourceError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        if !std::path::Path::new(&config.device).exists() {
            return Err(SourceError::NotFound(config.device.clone().into()));
        }
        let device = v4l::Device::with_path(&config.device)
            .map_err(|e| SourceError::Device(format!("open {}: {}", config.device, e)))?;
        let mut format = device
            .format()
            .map_err(|e| SourceError::Device(format!("read format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "CameraSource: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .map_err(|e| SourceError::Device(format!("read format: {}", e)))?
            }
        };
        if &format.fourcc.repr != b"RGB3" {
            return Err(SourceError::UnreadableFormat(format!(
                "{} does not deliver RGB24 frames",
                config.device
            )));
        }

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "CameraSource: failed to set fps on {}: {}",
                    config.device,
                    err
                );
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| SourceError::Device(format!("create buffer stream: {}", e)))
            },
        }
        .try_build()?;

        log::info!(
            "CameraSource: connected to {} ({}x{})",
            config.device,
            format.width,
            format.height
        );
        Ok(Self {
            state,
            device: config.device.clone(),
            frame_count: 0,
            width: format.width,
            height: format.height,
        })
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        use v4l::io::traits::CaptureStream;

        let device = self.device.clone();
        let pixels = self
            .state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|e| SourceError::Device(format!("capture from {}: {}", device, e)))?;
        self.frame_count += 1;
        Frame::new(pixels, self.width, self.height, self.frame_count)
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}
