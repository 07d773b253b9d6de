//! Drone edge analysis
//!
//! Runs one detection job at a time over a video source and streams per-frame
//! detection events to a sink.
//!
//! # Architecture
//!
//! `JobController::start` validates a video reference, clears the sink, and
//! launches a worker. The worker runs the pipeline loop:
//!
//! ```text
//! FrameSource -> DetectionEngine -> EventFormatter -> SessionRecorder -> EventSink
//! ```
//!
//! until the source ends or `JobController::stop` cancels it, then finalizes
//! the session through the sink.
//!
//! # Module Structure
//!
//! - `frame`: RGB frames and image sizes
//! - `ingest`: frame sources (files, cameras, synthetic `stub://` streams)
//! - `detect`: detection engine and model backends
//! - `event`: per-frame detection events
//! - `session`: session records and the per-job recorder
//! - `sink`: local-file and realtime-database sinks
//! - `pipeline`: the per-job frame loop
//! - `worker`: thread and child-process execution of the pipeline
//! - `job`: the job controller
//! - `api`: HTTP control surface
//! - `config`: file and environment configuration

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};

pub mod api;
pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod ingest;
pub mod job;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod worker;

pub use config::AppConfig;
pub use detect::{BoundingBox, Detection, DetectionEngine, EngineError};
pub use event::{DetectionEvent, EventFormatter, FormatError};
pub use frame::{Frame, ImageSize};
pub use ingest::{open_source, FrameSource, SourceError, SourceRef};
pub use job::{JobController, JobError, JobStatus, StartedJob, StopOutcome};
pub use pipeline::{JobSpec, PipelineSettings};
pub use session::{Session, SessionDelta, SessionRecorder, SessionStatus};
pub use sink::{EventSink, LatestDetections, LocalSink, RemoteSink, SinkError, SinkMode};
pub use worker::{CancelToken, ProcessLauncher, ThreadLauncher, Worker, WorkerLauncher};

/// Current UTC time as ISO-8601 with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Seconds since the Unix epoch. A clock before the epoch reads as 0.
pub fn now_unix_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_utc_iso8601() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(now_unix_s() > 1_600_000_000);
    }
}
