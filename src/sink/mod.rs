//! Destinations for detection events and session records.
//!
//! Two implementations share the `EventSink` trait:
//! - `LocalSink`: JSON files in an output directory, replaced atomically.
//! - `RemoteSink`: a realtime database reached over its REST API.
//!
//! The caller constructs one sink and hands it to the `JobController`; the
//! orchestrator never inspects which one it has beyond `mode()`.
//!
//! Sink failures during a run are not fatal. The pipeline logs them and keeps
//! processing frames.

pub mod local;
pub mod remote;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::DetectionEvent;
use crate::session::{Session, SessionDelta, SessionStatus};

pub use local::LocalSink;
pub use remote::{RealtimeStore, RemoteConfig, RemoteSink, RestStore};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink configuration error: {0}")]
    Config(String),

    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("sink request failed: {0}")]
    Http(String),

    #[error("sink state lock poisoned")]
    Poisoned,
}

/// Which sink implementation is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    Local,
    Remote,
}

impl SinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::Local => "local",
            SinkMode::Remote => "remote",
        }
    }

    /// Session id prefix for jobs written to this sink.
    pub fn session_prefix(&self) -> &'static str {
        match self {
            SinkMode::Local => "local",
            SinkMode::Remote => "inference",
        }
    }
}

/// The "latest detections" read model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestDetections {
    pub session_id: Option<String>,
    pub detections: Vec<DetectionEvent>,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEnd {
    pub status: SessionStatus,
    pub end_time: String,
    pub cancelled: bool,
}

pub trait EventSink: Send + Sync {
    fn mode(&self) -> SinkMode;

    /// Erase the previous run's artifacts. A no-op on an empty store.
    fn clear(&self) -> Result<(), SinkError>;

    /// Record the initial `active` session before the first event.
    fn begin_session(&self, session: &Session) -> Result<(), SinkError>;

    /// Deliver one event.
    fn push_event(&self, event: &DetectionEvent) -> Result<(), SinkError>;

    /// Merge absolute counters and a freshness timestamp into the durable
    /// session record. Safe to repeat and to reorder against `push_event`.
    fn update_session(&self, delta: &SessionDelta) -> Result<(), SinkError>;

    /// Terminal status transition, called once per session.
    fn finalize_session(&self, session_id: &str, end: &SessionEnd) -> Result<(), SinkError>;

    fn latest_detections(&self) -> Result<LatestDetections, SinkError>;

    fn latest_session(&self) -> Result<Option<Session>, SinkError>;
}
