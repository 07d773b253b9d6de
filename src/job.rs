//! The job controller: one analysis job at a time.
//!
//! State machine: `Idle -> Running` on a successful `start`, and back to
//! `Idle` on `stop`, natural completion, or pipeline failure. How the job
//! ended is recorded only in the session's final status.
//!
//! All state lives behind one mutex. `start` does its check-and-set under that
//! lock, `stop` and `status` read under it, and the worker's exit hook resets
//! the state under it too. The exit hook carries a generation number so a
//! late hook from an old job never resets a newer one.
//!
//! A second mutex serializes whole `start` calls, so one start's slow work
//! (joining the stopped predecessor, clearing the sink, launching) never
//! interleaves with another's. `stop` and `status` never take it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::detect::check_model_path;
use crate::ingest::{SourceError, SourceRef};
use crate::pipeline::{JobSpec, PipelineSettings};
use crate::session::Session;
use crate::sink::{EventSink, LatestDetections, SinkError, SinkMode};
use crate::worker::{CancelToken, ThreadLauncher, Worker, WorkerLauncher};

/// How often `wait` checks whether the worker has ended.
const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("analysis already running (session {0})")]
    AlreadyRunning(String),

    #[error("video not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid video reference: {0}")]
    InvalidVideoRef(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("worker error: {0}")]
    Worker(String),
}

impl From<SourceError> for JobError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(path) => JobError::NotFound(path),
            other => JobError::InvalidVideoRef(other.to_string()),
        }
    }
}

/// Returned by a successful `start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StartedJob {
    pub session_id: String,
    pub video_name: String,
}

/// Returned by `stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
}

/// Point-in-time copy of the job state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub running: bool,
    pub session_id: Option<String>,
    pub video_name: Option<String>,
    pub start_time: Option<String>,
}

#[derive(Default)]
struct JobState {
    running: bool,
    session_id: Option<String>,
    video_name: Option<String>,
    start_time: Option<String>,
    cancel: Option<CancelToken>,
    /// Current worker, or the last one until it is joined.
    worker: Option<Box<dyn Worker>>,
    generation: u64,
    /// Last issued id seconds and its same-second counter.
    last_issued: Option<(u64, u32)>,
}

impl JobState {
    fn snapshot(&self) -> JobStatus {
        JobStatus {
            running: self.running,
            session_id: self.session_id.clone(),
            video_name: self.video_name.clone(),
            start_time: self.start_time.clone(),
        }
    }

    fn reset(&mut self) {
        self.running = false;
        self.session_id = None;
        self.video_name = None;
        self.start_time = None;
        self.cancel = None;
    }

    fn next_session_id(&mut self, prefix: &str, now_secs: u64) -> String {
        let counter = match self.last_issued {
            Some((secs, n)) if secs == now_secs => n + 1,
            _ => 0,
        };
        self.last_issued = Some((now_secs, counter));
        if counter == 0 {
            format!("{}_{}", prefix, now_secs)
        } else {
            format!("{}_{}_{}", prefix, now_secs, counter)
        }
    }
}

pub struct JobController {
    sink: Arc<dyn EventSink>,
    launcher: Box<dyn WorkerLauncher>,
    settings: PipelineSettings,
    state: Arc<Mutex<JobState>>,
    launch: Mutex<()>,
}

impl JobController {
    /// Controller running jobs on in-process threads.
    pub fn new(sink: Arc<dyn EventSink>, settings: PipelineSettings) -> Self {
        let launcher = Box::new(ThreadLauncher::new(Arc::clone(&sink)));
        Self::with_launcher(sink, launcher, settings)
    }

    pub fn with_launcher(
        sink: Arc<dyn EventSink>,
        launcher: Box<dyn WorkerLauncher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sink,
            launcher,
            settings,
            state: Arc::new(Mutex::new(JobState::default())),
            launch: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn mode(&self) -> SinkMode {
        self.sink.mode()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Start a job on `video_ref`. Returns as soon as the worker is launched.
    /// Concurrent calls run one after another.
    pub fn start(&self, video_ref: &str) -> Result<StartedJob, JobError> {
        let video = SourceRef::parse(video_ref)?;
        let _launch = match self.launch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Check and reserve under one lock; the slow work happens after it.
        let (job, cancel, generation, previous) = {
            let mut state = self.lock();
            if state.running {
                return Err(JobError::AlreadyRunning(
                    state.session_id.clone().unwrap_or_default(),
                ));
            }
            video.validate()?;
            if !self.settings.model_ref.starts_with("stub://") {
                check_model_path(&self.settings.model_ref)
                    .map_err(|e| JobError::Config(e.to_string()))?;
            }

            let session_id =
                state.next_session_id(self.sink.mode().session_prefix(), crate::now_unix_s());
            let start_time = crate::now_iso8601();
            let cancel = CancelToken::new();
            state.generation += 1;
            state.running = true;
            state.session_id = Some(session_id.clone());
            state.video_name = Some(video.display_name());
            state.start_time = Some(start_time.clone());
            state.cancel = Some(cancel.clone());
            let job = JobSpec {
                session_id,
                video_ref: video_ref.trim().to_string(),
                video,
                start_time,
                settings: self.settings.clone(),
            };
            (job, cancel, state.generation, state.worker.take())
        };

        // A stopped job may still be finishing its last frame.
        if let Some(mut previous) = previous {
            previous.cancel();
            if let Err(err) = previous.join() {
                log::warn!("JobController: previous job ended with error: {}", err);
            }
        }

        let started = StartedJob {
            session_id: job.session_id.clone(),
            video_name: job.video.display_name(),
        };
        if self.stopped_before_launch(&cancel, &started) {
            return Ok(started);
        }
        if let Err(err) = self.sink.clear() {
            self.release(generation);
            return Err(err.into());
        }
        if self.stopped_before_launch(&cancel, &started) {
            return Ok(started);
        }
        let exit_state = Arc::clone(&self.state);
        let on_exit = Box::new(move || {
            let mut state = match exit_state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.generation == generation && state.running {
                state.reset();
            }
        });

        let mut worker = match self.launcher.launch(job, cancel.clone(), on_exit) {
            Ok(worker) => worker,
            Err(err) => {
                self.release(generation);
                return Err(err);
            }
        };
        {
            let mut state = self.lock();
            // Stopped while launching.
            if cancel.is_cancelled() {
                worker.cancel();
            }
            state.worker = Some(worker);
        }
        log::info!(
            "JobController: started session {} on {}",
            started.session_id,
            started.video_name
        );
        Ok(started)
    }

    /// A `stop` that lands before launch already reset the state; the job
    /// ends without touching the sink further.
    fn stopped_before_launch(&self, cancel: &CancelToken, started: &StartedJob) -> bool {
        let stopped = cancel.is_cancelled();
        if stopped {
            log::info!(
                "JobController: session {} stopped before launch",
                started.session_id
            );
        }
        stopped
    }

    /// Undo a reservation that never launched.
    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.reset();
        }
    }

    /// Request cancellation of the running job. Never fails.
    pub fn stop(&self) -> StopOutcome {
        let mut state = self.lock();
        if !state.running {
            return StopOutcome { stopped: false };
        }
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        if let Some(worker) = state.worker.as_mut() {
            worker.cancel();
        }
        log::info!(
            "JobController: stop requested for session {}",
            state.session_id.as_deref().unwrap_or("?")
        );
        state.reset();
        StopOutcome { stopped: true }
    }

    pub fn status(&self) -> JobStatus {
        self.lock().snapshot()
    }

    /// Block until the current (or last stopped) worker has ended.
    ///
    /// The worker stays in the controller while it runs, so a concurrent
    /// `stop` still reaches it.
    pub fn wait(&self) -> Result<(), JobError> {
        loop {
            let finished = {
                let mut state = self.lock();
                match state.worker.as_ref() {
                    None => return Ok(()),
                    Some(worker) if worker.is_finished() => state.worker.take(),
                    Some(_) => None,
                }
            };
            if let Some(mut worker) = finished {
                return worker.join();
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Stop any running job and wait for it.
    pub fn shutdown(&self) -> Result<(), JobError> {
        self.stop();
        self.wait()
    }

    pub fn latest_detections(&self) -> Result<LatestDetections, SinkError> {
        self.sink.latest_detections()
    }

    pub fn latest_session(&self) -> Result<Option<Session>, SinkError> {
        self.sink.latest_session()
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        // State stays consistent across a panic in a hook; keep serving.
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("JobController: shutdown: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LocalSink;
    use tempfile::TempDir;

    fn controller(dir: &TempDir) -> JobController {
        let sink: Arc<dyn EventSink> = Arc::new(LocalSink::new(dir.path()).unwrap());
        JobController::new(
            sink,
            PipelineSettings {
                model_ref: "stub://model".to_string(),
                ..PipelineSettings::default()
            },
        )
    }

    #[test]
    fn session_ids_stay_unique_within_a_second() {
        let mut state = JobState::default();
        assert_eq!(state.next_session_id("local", 1700000000), "local_1700000000");
        assert_eq!(state.next_session_id("local", 1700000000), "local_1700000000_1");
        assert_eq!(state.next_session_id("local", 1700000000), "local_1700000000_2");
        assert_eq!(state.next_session_id("local", 1700000001), "local_1700000001");
    }

    #[test]
    fn invalid_reference_is_rejected_synchronously() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        assert!(matches!(
            controller.start("clip.txt"),
            Err(JobError::InvalidVideoRef(_))
        ));
        assert!(matches!(
            controller.start("/nonexistent/clip.mp4"),
            Err(JobError::NotFound(_))
        ));
        assert!(!controller.status().running);
    }

    #[test]
    fn missing_model_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let sink: Arc<dyn EventSink> = Arc::new(LocalSink::new(dir.path()).unwrap());
        let controller = JobController::new(
            sink,
            PipelineSettings {
                model_ref: "/nonexistent/best.onnx".to_string(),
                ..PipelineSettings::default()
            },
        );
        assert!(matches!(
            controller.start("stub://clip?frames=3"),
            Err(JobError::Config(_))
        ));
        assert!(!controller.status().running);
    }

    #[test]
    fn status_reports_running_job() {
        let dir = TempDir::new().unwrap();
        let controller = controller(&dir);
        let started = controller.start("stub://live?width=16&height=16&delay_ms=5").unwrap();
        assert!(started.session_id.starts_with("local_"));
        let status = controller.status();
        assert!(status.running);
        assert_eq!(status.session_id.as_deref(), Some(started.session_id.as_str()));
        assert_eq!(status.video_name.as_deref(), Some("stub://live"));
        assert!(controller.stop().stopped);
        controller.wait().unwrap();
        assert_eq!(controller.status(), JobStatus::default());
    }

    #[cfg(unix)]
    #[test]
    fn stop_reaches_process_worker_while_waiting() {
        use crate::worker::ProcessLauncher;
        use std::sync::mpsc;

        let dir = TempDir::new().unwrap();
        let sink: Arc<dyn EventSink> = Arc::new(LocalSink::new(dir.path()).unwrap());
        let launcher = ProcessLauncher::new("sh").with_prefix(["-c", "sleep 30", "--"]);
        let controller = Arc::new(JobController::with_launcher(
            sink,
            Box::new(launcher),
            PipelineSettings {
                model_ref: "stub://model".to_string(),
                ..PipelineSettings::default()
            },
        ));
        controller.start("stub://clip?frames=1").unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&controller);
        let handle = std::thread::spawn(move || {
            let _ = tx.send(waiter.wait());
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(controller.stop().stopped);
        let waited = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("wait should return once the process is stopped");
        assert!(waited.is_ok());
        handle.join().unwrap();
        assert!(!controller.status().running);
    }
}
