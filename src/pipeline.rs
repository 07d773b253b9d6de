//! The per-job frame loop.
//!
//! One run is strictly sequential: read a frame, detect, format, record,
//! push. The cancel token is checked once per frame boundary, so the frame in
//! flight always completes. Errors local to one frame (a failed push, a failed
//! inference) are logged and absorbed; an error that stops progress (source or
//! model unusable, decode failure, a panic in the frame loop) ends the run
//! with a `failed` session.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Context, Result};

use crate::detect::DetectionEngine;
use crate::event::{self, DetectionEvent, EventFormatter};
use crate::ingest::{self, SourceRef};
use crate::session::{Session, SessionRecorder, SessionStatus};
use crate::sink::{EventSink, SessionEnd};
use crate::worker::CancelToken;

/// Knobs read once at job start.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub model_ref: String,
    pub confidence_threshold: f32,
    pub flush_interval: u64,
    pub log_fps: bool,
    pub log_interval: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            model_ref: "models/best.onnx".to_string(),
            confidence_threshold: 0.25,
            flush_interval: 10,
            log_fps: true,
            log_interval: 30,
        }
    }
}

/// Everything a worker needs to run one job.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub session_id: String,
    /// Reference as the caller supplied it.
    pub video_ref: String,
    pub video: SourceRef,
    pub start_time: String,
    pub settings: PipelineSettings,
}

/// Per-frame callback, used by the CLI progress display.
pub trait FrameObserver {
    fn on_frame(&mut self, event: &DetectionEvent, progress: f64);
}

impl FrameObserver for () {
    fn on_frame(&mut self, _event: &DetectionEvent, _progress: f64) {}
}

/// Run one job to completion, cancellation, or failure, and return the final
/// session record. Pipeline errors and panics in the frame loop end up in the
/// session's status.
///
/// A job cancelled before it begins leaves the sink untouched.
pub fn run(
    job: &JobSpec,
    sink: &dyn EventSink,
    cancel: &CancelToken,
    observer: &mut dyn FrameObserver,
) -> Session {
    let session = Session::new(
        job.session_id.clone(),
        job.start_time.clone(),
        Some(job.video_ref.clone()),
    );
    let mut recorder = SessionRecorder::new(session, job.settings.flush_interval);
    if cancel.is_cancelled() {
        log::info!("pipeline: session {} stopped before start", job.session_id);
        return recorder.finish(SessionStatus::Completed, &crate::now_iso8601(), true);
    }
    if let Err(err) = sink.begin_session(&recorder.snapshot()) {
        log::warn!("pipeline: could not record session start: {}", err);
    }
    log::info!(
        "pipeline: session {} started on {}",
        job.session_id,
        job.video_ref
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        stream(job, sink, cancel, observer, &mut recorder)
    }))
    .unwrap_or_else(|payload| Err(anyhow!("frame loop panicked: {}", panic_message(&*payload))));
    let status = match outcome {
        Ok(()) => SessionStatus::Completed,
        Err(err) => {
            log::error!("pipeline: session {} failed: {:#}", job.session_id, err);
            SessionStatus::Failed
        }
    };

    let end_time = crate::now_iso8601();
    let delta = recorder.take_delta(&end_time);
    if let Err(err) = sink.update_session(&delta) {
        log::warn!("pipeline: final session flush failed: {}", err);
    }
    let end = SessionEnd {
        status,
        end_time: end_time.clone(),
        cancelled: cancel.is_cancelled(),
    };
    if let Err(err) = sink.finalize_session(&job.session_id, &end) {
        log::error!(
            "pipeline: could not finalize session {}: {}",
            job.session_id,
            err
        );
    }

    let session = recorder.finish(status, &end_time, end.cancelled);
    log::info!(
        "pipeline: session {} {}{} ({} frames, {} detections)",
        session.session_id,
        session.status.as_str(),
        if session.cancelled { " after stop" } else { "" },
        session.frame_count,
        session.total_detections
    );
    session
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn stream(
    job: &JobSpec,
    sink: &dyn EventSink,
    cancel: &CancelToken,
    observer: &mut dyn FrameObserver,
    recorder: &mut SessionRecorder,
) -> Result<()> {
    let settings = &job.settings;
    let mut engine = DetectionEngine::load(&settings.model_ref, settings.confidence_threshold)
        .with_context(|| format!("load model {}", settings.model_ref))?;
    let mut source =
        ingest::open_source(&job.video).with_context(|| format!("open {}", job.video_ref))?;
    log::info!("pipeline: reading from {}", source.describe());

    let formatter = EventFormatter::new(recorder.session_id());
    let outcome = (|| -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                log::info!(
                    "pipeline: stop requested after {} frames",
                    recorder.frame_count()
                );
                return Ok(());
            }
            let Some(frame) = source.read_frame()? else {
                log::info!("pipeline: end of stream");
                return Ok(());
            };

            let detections = engine.predict(&frame);
            let frame_id = recorder.frame_count() + 1;
            let event = formatter.format(frame_id, crate::now_iso8601(), detections, frame.size())?;
            recorder.record_frame(event.detection_count);

            if event.detection_count > 0 {
                log::info!("{}", event::summary(&event));
            } else {
                log::debug!("{}", event::summary(&event));
            }
            if let Err(err) = sink.push_event(&event) {
                log::warn!("pipeline: frame {} not delivered: {}", frame_id, err);
            }
            let progress = source.progress();
            observer.on_frame(&event, progress);

            if recorder.should_flush() {
                let delta = recorder.take_delta(&event.timestamp);
                if let Err(err) = sink.update_session(&delta) {
                    log::warn!("pipeline: session update failed: {}", err);
                }
            }
            if settings.log_fps && frame_id % settings.log_interval.max(1) == 0 {
                if progress >= 0.0 {
                    log::info!(
                        "pipeline: frame {} progress={:.1}% fps={:.1} avg_inference={:.1}ms detections={}",
                        frame_id,
                        progress,
                        engine.estimated_fps(),
                        engine.average_latency_ms(),
                        recorder.total_detections()
                    );
                } else {
                    log::info!(
                        "pipeline: frame {} progress=live fps={:.1} avg_inference={:.1}ms detections={}",
                        frame_id,
                        engine.estimated_fps(),
                        engine.average_latency_ms(),
                        recorder.total_detections()
                    );
                }
            }
        }
    })();
    source.close();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LocalSink;
    use tempfile::TempDir;

    fn job(video: &str, model: &str) -> JobSpec {
        JobSpec {
            session_id: "local_100".to_string(),
            video_ref: video.to_string(),
            video: SourceRef::parse(video).unwrap(),
            start_time: "2026-01-14T10:00:00Z".to_string(),
            settings: PipelineSettings {
                model_ref: model.to_string(),
                flush_interval: 3,
                ..PipelineSettings::default()
            },
        }
    }

    #[test]
    fn finite_source_completes() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        let session = run(
            &job("stub://clip?frames=5&width=64&height=48", "stub://model?detect=2:1:0.9"),
            &sink,
            &CancelToken::new(),
            &mut (),
        );
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.frame_count, 5);
        assert_eq!(session.total_detections, 1);

        let stored = sink.latest_session().unwrap().unwrap();
        assert_eq!(stored.frame_count, 5);
        assert_eq!(stored.status, SessionStatus::Completed);
    }

    #[test]
    fn cancelled_before_first_frame_records_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let session = run(&job("stub://clip?frames=5", "stub://model"), &sink, &cancel, &mut ());
        assert_eq!(session.frame_count, 0);
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.cancelled);
        assert!(sink.latest_session().unwrap().is_none());
    }

    #[test]
    fn panic_in_frame_loop_fails_session() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        let session = run(
            &job("stub://clip?frames=5", "stub://model?panic=3"),
            &sink,
            &CancelToken::new(),
            &mut (),
        );
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.frame_count, 2);

        let stored = sink.latest_session().unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.frame_count, 2);
        assert!(stored.end_time.is_some());
        assert_eq!(sink.latest_detections().unwrap().detections.len(), 2);
    }

    #[test]
    fn unusable_model_fails_session() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        let session = run(
            &job("stub://clip?frames=5", "/nonexistent/best.onnx"),
            &sink,
            &CancelToken::new(),
            &mut (),
        );
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(
            sink.latest_session().unwrap().unwrap().status,
            SessionStatus::Failed
        );
    }

    #[test]
    fn observer_sees_every_frame() {
        struct Count(Vec<u64>);
        impl FrameObserver for Count {
            fn on_frame(&mut self, event: &DetectionEvent, progress: f64) {
                assert!((0.0..=100.0).contains(&progress));
                self.0.push(event.frame_id);
            }
        }
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        let mut seen = Count(Vec::new());
        run(&job("stub://clip?frames=4", "stub://model"), &sink, &CancelToken::new(), &mut seen);
        assert_eq!(seen.0, vec![1, 2, 3, 4]);
    }
}
