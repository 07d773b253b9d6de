//! File-backed sink.
//!
//! Layout inside the output directory:
//! - `current_detections.json`: `{session_id, detections[]}`, the full event
//!   list of the running session, rewritten after every push.
//! - `current_session.json`: the session record.
//! - `detections_<session>_<YYYYmmdd_HHMMSS>.json`: immutable archive written
//!   once at finalize.
//!
//! Every write goes to a temp file in the same directory and is renamed over
//! the target, so readers never see a partial document.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tempfile::NamedTempFile;

use super::{EventSink, LatestDetections, SessionEnd, SinkError, SinkMode};
use crate::event::DetectionEvent;
use crate::session::{Session, SessionDelta};

pub const DETECTIONS_FILE: &str = "current_detections.json";
pub const SESSION_FILE: &str = "current_session.json";

pub struct LocalSink {
    dir: PathBuf,
    save_archive: bool,
    state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalState {
    session: Option<Session>,
    events: Vec<DetectionEvent>,
}

#[derive(Serialize)]
struct DetectionsDocument<'a> {
    session_id: Option<&'a str>,
    detections: &'a [DetectionEvent],
}

#[derive(Serialize)]
struct ArchiveDocument<'a> {
    session: &'a Session,
    detections: &'a [DetectionEvent],
}

impl LocalSink {
    /// Open (and create) the output directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            save_archive: true,
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Toggle the archive snapshot written at finalize.
    pub fn with_archive(mut self, save_archive: bool) -> Self {
        self.save_archive = save_archive;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn detections_path(&self) -> PathBuf {
        self.dir.join(DETECTIONS_FILE)
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>, SinkError> {
        self.state.lock().map_err(|_| SinkError::Poisoned)
    }

    fn write_detections(&self, state: &LocalState) -> Result<(), SinkError> {
        let doc = DetectionsDocument {
            session_id: state.session.as_ref().map(|s| s.session_id.as_str()),
            detections: &state.events,
        };
        write_json_atomic(&self.dir, &self.detections_path(), &doc, false)
    }

    fn write_session(&self, session: &Session) -> Result<(), SinkError> {
        write_json_atomic(&self.dir, &self.session_path(), session, true)
    }

    fn write_archive(&self, state: &LocalState, session: &Session) -> Result<PathBuf, SinkError> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .dir
            .join(format!("detections_{}_{}.json", session.session_id, stamp));
        let doc = ArchiveDocument {
            session,
            detections: &state.events,
        };
        write_json_atomic(&self.dir, &path, &doc, true)?;
        Ok(path)
    }
}

impl EventSink for LocalSink {
    fn mode(&self) -> SinkMode {
        SinkMode::Local
    }

    fn clear(&self) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        remove_if_exists(&self.detections_path())?;
        remove_if_exists(&self.session_path())?;
        *state = LocalState::default();
        log::info!("LocalSink: cleared detection data in {}", self.dir.display());
        Ok(())
    }

    fn begin_session(&self, session: &Session) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        state.session = Some(session.clone());
        state.events.clear();
        self.write_session(session)?;
        self.write_detections(&state)
    }

    fn push_event(&self, event: &DetectionEvent) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        if let Some(session) = &state.session {
            if session.session_id != event.session_id {
                log::warn!(
                    "LocalSink: event for session {} while {} is active",
                    event.session_id,
                    session.session_id
                );
            }
        }
        // Kept in memory even if the write fails; the next write carries it.
        state.events.push(event.clone());
        self.write_detections(&state)
    }

    fn update_session(&self, delta: &SessionDelta) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        let Some(session) = state.session.as_mut() else {
            return Err(SinkError::Config(format!(
                "no session begun for update of {}",
                delta.session_id
            )));
        };
        if session.session_id != delta.session_id {
            log::warn!(
                "LocalSink: ignoring update for stale session {}",
                delta.session_id
            );
            return Ok(());
        }
        session.apply(delta);
        let session = session.clone();
        self.write_session(&session)
    }

    fn finalize_session(&self, session_id: &str, end: &SessionEnd) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        let Some(session) = state.session.as_mut() else {
            return Err(SinkError::Config(format!(
                "no session begun for finalize of {}",
                session_id
            )));
        };
        if session.session_id != session_id {
            return Err(SinkError::Config(format!(
                "finalize for {} but {} is active",
                session_id, session.session_id
            )));
        }
        if !session.finalize(end.status, &end.end_time, end.cancelled) {
            log::warn!("LocalSink: session {} already finalized", session_id);
            return Ok(());
        }
        let session = session.clone();
        self.write_session(&session)?;
        if self.save_archive {
            let path = self.write_archive(&state, &session)?;
            log::info!("LocalSink: archived session to {}", path.display());
        }
        Ok(())
    }

    fn latest_detections(&self) -> Result<LatestDetections, SinkError> {
        match std::fs::read(self.detections_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(LatestDetections::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn latest_session(&self) -> Result<Option<Session>, SinkError> {
        match std::fs::read(self.session_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn write_json_atomic<T: Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
    pretty: bool,
) -> Result<(), SinkError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        if pretty {
            serde_json::to_writer_pretty(&mut writer, value)?;
        } else {
            serde_json::to_writer(&mut writer, value)?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SinkError::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), SinkError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFormatter;
    use crate::frame::ImageSize;
    use crate::session::SessionStatus;
    use tempfile::TempDir;

    fn begin(sink: &LocalSink, id: &str) {
        sink.begin_session(&Session::new(id, "2026-01-14T10:00:00Z", None))
            .unwrap();
    }

    #[test]
    fn clear_on_empty_store_is_noop() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        sink.clear().unwrap();
        sink.clear().unwrap();
        assert_eq!(sink.latest_detections().unwrap(), LatestDetections::default());
        assert!(sink.latest_session().unwrap().is_none());
    }

    #[test]
    fn pushes_are_readable_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        begin(&sink, "local_1");
        let formatter = EventFormatter::new("local_1");
        for frame_id in 1..=5 {
            let event = formatter
                .format(frame_id, "t", Vec::new(), ImageSize::new(4, 4))
                .unwrap();
            sink.push_event(&event).unwrap();
        }
        let latest = sink.latest_detections().unwrap();
        assert_eq!(latest.session_id.as_deref(), Some("local_1"));
        let ids: Vec<u64> = latest.detections.iter().map(|e| e.frame_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn finalize_writes_session_and_archive() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        begin(&sink, "local_2");
        sink.update_session(&SessionDelta {
            session_id: "local_2".to_string(),
            frame_count: 4,
            total_detections: 1,
            last_update: "2026-01-14T10:00:04Z".to_string(),
        })
        .unwrap();
        let end = SessionEnd {
            status: SessionStatus::Completed,
            end_time: "2026-01-14T10:00:05Z".to_string(),
            cancelled: false,
        };
        sink.finalize_session("local_2", &end).unwrap();

        let session = sink.latest_session().unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.frame_count, 4);
        assert_eq!(session.end_time.as_deref(), Some("2026-01-14T10:00:05Z"));

        let archives: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("detections_local_2_")
            })
            .collect();
        assert_eq!(archives.len(), 1);
    }

    #[test]
    fn archive_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap().with_archive(false);
        begin(&sink, "local_3");
        let end = SessionEnd {
            status: SessionStatus::Failed,
            end_time: "t".to_string(),
            cancelled: false,
        };
        sink.finalize_session("local_3", &end).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.starts_with("detections_")));
    }

    #[test]
    fn clear_removes_previous_run() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap();
        begin(&sink, "local_4");
        assert!(sink.detections_path().exists());
        sink.clear().unwrap();
        assert!(!sink.detections_path().exists());
        assert!(!sink.session_path().exists());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path()).unwrap().with_archive(false);
        begin(&sink, "local_5");
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }
}
