//! Session records and the per-job recorder.
//!
//! `SessionRecorder` owns the in-memory counters of one running job. The sink
//! owns the durable copy, fed through `SessionDelta` updates at a bounded
//! cadence and one final flush before the session is finalized.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Aggregate record of one analysis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub start_time: String,
    #[serde(default)]
    pub end_time: Option<String>,
    pub status: SessionStatus,
    pub frame_count: u64,
    pub total_detections: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    /// Set when the job ended because of a stop request.
    #[serde(default)]
    pub cancelled: bool,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        start_time: impl Into<String>,
        video_path: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: start_time.into(),
            end_time: None,
            status: SessionStatus::Active,
            frame_count: 0,
            total_detections: 0,
            video_path,
            last_update: None,
            cancelled: false,
        }
    }

    /// Merge absolute counters. Counters only move forward, so re-applying
    /// or reordering updates never lowers them.
    pub fn apply(&mut self, delta: &SessionDelta) {
        self.frame_count = self.frame_count.max(delta.frame_count);
        self.total_detections = self.total_detections.max(delta.total_detections);
        let newer = match &self.last_update {
            Some(current) => delta.last_update.as_str() > current.as_str(),
            None => true,
        };
        if newer {
            self.last_update = Some(delta.last_update.clone());
        }
    }

    /// Terminal transition. Only an active session moves.
    pub fn finalize(&mut self, status: SessionStatus, end_time: &str, cancelled: bool) -> bool {
        if self.status != SessionStatus::Active {
            return false;
        }
        self.status = status;
        self.end_time = Some(end_time.to_string());
        self.cancelled = cancelled;
        true
    }
}

/// Absolute counter values plus a freshness timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDelta {
    pub session_id: String,
    pub frame_count: u64,
    pub total_detections: u64,
    pub last_update: String,
}

/// In-memory counters owned by one pipeline run.
#[derive(Debug)]
pub struct SessionRecorder {
    session: Session,
    flush_interval: u64,
    frames_since_flush: u64,
}

impl SessionRecorder {
    /// `flush_interval` is the number of frames between sink updates.
    pub fn new(session: Session, flush_interval: u64) -> Self {
        Self {
            session,
            flush_interval: flush_interval.max(1),
            frames_since_flush: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn record_frame(&mut self, detection_count: usize) {
        self.session.frame_count += 1;
        self.session.total_detections += detection_count as u64;
        self.frames_since_flush += 1;
    }

    pub fn frame_count(&self) -> u64 {
        self.session.frame_count
    }

    pub fn total_detections(&self) -> u64 {
        self.session.total_detections
    }

    /// Read-only copy of the current record.
    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    /// True once `flush_interval` frames have been recorded since the last
    /// `take_delta`.
    pub fn should_flush(&self) -> bool {
        self.frames_since_flush >= self.flush_interval
    }

    /// Current counters for a sink update; resets the flush cadence.
    pub fn take_delta(&mut self, now: &str) -> SessionDelta {
        self.frames_since_flush = 0;
        self.session.last_update = Some(now.to_string());
        SessionDelta {
            session_id: self.session.session_id.clone(),
            frame_count: self.session.frame_count,
            total_detections: self.session.total_detections,
            last_update: now.to_string(),
        }
    }

    /// Close the in-memory record and return it.
    pub fn finish(mut self, status: SessionStatus, end_time: &str, cancelled: bool) -> Session {
        self.session.finalize(status, end_time, cancelled);
        self.session
    }
}
