//! Local file frame source.
//!
//! `FileSource` reads a finite video, either decoded with FFmpeg
//! (feature: ingest-file-ffmpeg) or generated by a synthetic `stub://` clip.
//! Progress is reported against the container's frame count when it is known.

use std::path::Path;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::SyntheticFrames;
use super::{FrameSource, SourceError, SyntheticSpec};
use crate::frame::Frame;

/// Finite frame source.
pub struct FileSource {
    description: String,
    backend: Option<FileBackend>,
    frames_read: u64,
    total_frames: Option<u64>,
}

enum FileBackend {
    Synthetic(SyntheticFrames),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    /// Open a local video file.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.is_file() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let source = FfmpegFileSource::open(path)?;
            let total_frames = source.total_frames();
            log::info!(
                "FileSource: opened {} ({}x{}, {} frames)",
                path.display(),
                source.width(),
                source.height(),
                total_frames
                    .map(|total| total.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            Ok(Self {
                description: path.display().to_string(),
                backend: Some(FileBackend::Ffmpeg(source)),
                frames_read: 0,
                total_frames,
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(SourceError::UnreadableFormat(format!(
                "decoding {} requires the ingest-file-ffmpeg feature",
                path.display()
            )))
        }
    }

    /// Finite synthetic clip. `spec.frames` must be set.
    pub fn synthetic(spec: SyntheticSpec) -> Self {
        let description = format!("stub://{} (synthetic clip)", spec.name);
        log::info!(
            "FileSource: opened {} ({}x{}, {} frames)",
            description,
            spec.width,
            spec.height,
            spec.frames.unwrap_or(0)
        );
        Self {
            description,
            total_frames: spec.frames,
            backend: Some(FileBackend::Synthetic(SyntheticFrames::new(spec))),
            frames_read: 0,
        }
    }
}

impl FrameSource for FileSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let frame = match self.backend.as_mut() {
            None => return Ok(None),
            Some(FileBackend::Synthetic(source)) => source.next_frame()?,
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(FileBackend::Ffmpeg(source)) => source.next_frame()?,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn is_live(&self) -> bool {
        false
    }

    fn close(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "FileSource: released {} (frames read: {})",
                self.description,
                self.frames_read
            );
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn clip(frames: u64) -> SyntheticSpec {
        SyntheticSpec {
            name: "clip".to_string(),
            frames: Some(frames),
            width: 8,
            height: 6,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn synthetic_clip_ends_after_frame_count() {
        let mut source = FileSource::synthetic(clip(3));
        let mut sequences = Vec::new();
        while let Some(frame) = source.read_frame().unwrap() {
            assert_eq!((frame.width, frame.height), (8, 6));
            sequences.push(frame.sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(source.frames_read(), 3);
        assert_eq!(source.progress(), 100.0);
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn empty_clip_is_complete_from_the_start() {
        let reference = crate::ingest::SourceRef::parse("stub://x?frames=0").unwrap();
        let mut source = crate::ingest::open_source(&reference).unwrap();
        assert!(!source.is_live());
        assert_eq!(source.progress(), 100.0);
        assert!(source.read_frame().unwrap().is_none());
        assert_eq!(source.progress(), 100.0);
    }

    #[test]
    fn progress_advances_with_reads() {
        let mut source = FileSource::synthetic(clip(4));
        assert_eq!(source.progress(), 0.0);
        source.read_frame().unwrap();
        assert_eq!(source.progress(), 25.0);
    }

    #[test]
    fn close_is_idempotent_and_ends_stream() {
        let mut source = FileSource::synthetic(clip(10));
        source.read_frame().unwrap();
        source.close();
        source.close();
        assert!(source.read_frame().unwrap().is_none());
        assert_eq!(source.frames_read(), 1);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = FileSource::open(Path::new("/nonexistent/field.mp4")).err();
        assert!(matches!(err, Some(SourceError::NotFound(_))));
    }
}
