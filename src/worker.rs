//! Execution backends for a job's frame loop.
//!
//! The controller only ever sees `Worker` (cancel / is_finished / join) and a
//! `WorkerLauncher` that creates one per job:
//! - `ThreadLauncher` runs the pipeline on a named thread in this process.
//! - `ProcessLauncher` runs `drone-edge run` as a child process and stops it
//!   with a termination signal, which the child turns into a cooperative stop.
//!
//! Either way, the launcher calls the exit hook exactly once when the job is
//! over, however it ended.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::job::JobError;
use crate::pipeline::{self, JobSpec};
use crate::sink::EventSink;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared between controller and pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Called once when a job is over.
pub type ExitHook = Box<dyn FnOnce() + Send + 'static>;

/// Runs the hook when dropped, so a panicking pipeline still reports back.
struct ExitGuard(Option<ExitHook>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

pub trait Worker: Send {
    /// Request a stop. Idempotent; a no-op once the job is over.
    fn cancel(&mut self);

    fn is_finished(&self) -> bool;

    /// Wait for the job to end.
    fn join(&mut self) -> Result<(), JobError>;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        job: JobSpec,
        cancel: CancelToken,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, JobError>;
}

/// In-process worker thread.
pub struct ThreadLauncher {
    sink: Arc<dyn EventSink>,
}

impl ThreadLauncher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(
        &self,
        job: JobSpec,
        cancel: CancelToken,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, JobError> {
        let sink = Arc::clone(&self.sink);
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("pipeline-{}", job.session_id))
            .spawn(move || {
                let _guard = ExitGuard(Some(on_exit));
                pipeline::run(&job, sink.as_ref(), &token, &mut ());
            })
            .map_err(|e| JobError::Worker(format!("spawn pipeline thread: {}", e)))?;
        Ok(Box::new(ThreadWorker {
            handle: Some(handle),
            cancel,
        }))
    }
}

pub struct ThreadWorker {
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
}

impl Worker for ThreadWorker {
    fn cancel(&mut self) {
        self.cancel.cancel();
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn join(&mut self) -> Result<(), JobError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| JobError::Worker("pipeline thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

/// Child-process worker running the `run` subcommand.
pub struct ProcessLauncher {
    program: PathBuf,
    /// Leading arguments; `["run"]` unless replaced.
    prefix: Vec<String>,
    /// Arguments between the prefix and the per-job ones, e.g. `--sink local`.
    base_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: vec!["run".to_string()],
            base_args: Vec::new(),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe() -> Result<Self, JobError> {
        let exe = std::env::current_exe()
            .map_err(|e| JobError::Worker(format!("locate current executable: {}", e)))?;
        Ok(Self::new(exe))
    }

    pub fn with_prefix<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, job: &JobSpec) -> Command {
        let settings = &job.settings;
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix)
            .args(&self.base_args)
            .arg("--video")
            .arg(&job.video_ref)
            .arg("--session-id")
            .arg(&job.session_id)
            .arg("--start-time")
            .arg(&job.start_time)
            .arg("--model")
            .arg(&settings.model_ref)
            .arg("--confidence")
            .arg(settings.confidence_threshold.to_string())
            .arg("--ui")
            .arg("plain")
            .stdin(Stdio::null());
        command
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        job: JobSpec,
        cancel: CancelToken,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, JobError> {
        let child = self
            .command(&job)
            .spawn()
            .map_err(|e| JobError::Worker(format!("spawn {}: {}", self.program.display(), e)))?;
        log::info!(
            "ProcessLauncher: session {} running as pid {}",
            job.session_id,
            child.id()
        );
        let child = Arc::new(Mutex::new(child));
        let monitored = Arc::clone(&child);
        let token = cancel.clone();
        let monitor = thread::Builder::new()
            .name(format!("worker-{}", job.session_id))
            .spawn(move || {
                let _guard = ExitGuard(Some(on_exit));
                wait_for_exit(&monitored, &token)
            })
            .map_err(|e| JobError::Worker(format!("spawn monitor thread: {}", e)))?;
        Ok(Box::new(ProcessWorker {
            child,
            monitor: Some(monitor),
            cancel,
        }))
    }
}

/// Poll the child until it exits. A cancelled token gets the child one
/// termination signal even when nobody calls `ProcessWorker::cancel`.
fn wait_for_exit(child: &Mutex<Child>, cancel: &CancelToken) -> Result<ExitStatus, JobError> {
    let mut signalled = false;
    loop {
        {
            let mut child = child
                .lock()
                .map_err(|_| JobError::Worker("child handle lock poisoned".to_string()))?;
            if let Some(status) = child
                .try_wait()
                .map_err(|e| JobError::Worker(format!("wait for child: {}", e)))?
            {
                return Ok(status);
            }
            if cancel.is_cancelled() && !signalled {
                signalled = true;
                if let Err(err) = terminate(&mut child) {
                    log::warn!("ProcessWorker: could not signal pid {}: {}", child.id(), err);
                }
            }
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

pub struct ProcessWorker {
    child: Arc<Mutex<Child>>,
    monitor: Option<JoinHandle<Result<ExitStatus, JobError>>>,
    cancel: CancelToken,
}

impl Worker for ProcessWorker {
    fn cancel(&mut self) {
        self.cancel.cancel();
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        // An exited child is simply not running any more.
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Err(err) = terminate(&mut child) {
            log::warn!("ProcessWorker: could not signal pid {}: {}", child.id(), err);
        }
    }

    fn is_finished(&self) -> bool {
        self.monitor.as_ref().map_or(true, |m| m.is_finished())
    }

    fn join(&mut self) -> Result<(), JobError> {
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        let status = monitor
            .join()
            .map_err(|_| JobError::Worker("monitor thread panicked".to_string()))??;
        if status.success() || self.cancel.is_cancelled() {
            Ok(())
        } else {
            Err(JobError::Worker(format!("pipeline process exited with {}", status)))
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a pid we spawned and still hold a handle to.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SourceRef;
    use crate::pipeline::PipelineSettings;
    use crate::sink::LocalSink;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn job(video: &str) -> JobSpec {
        JobSpec {
            session_id: "local_7".to_string(),
            video_ref: video.to_string(),
            video: SourceRef::parse(video).unwrap(),
            start_time: "2026-01-14T10:00:00Z".to_string(),
            settings: PipelineSettings {
                model_ref: "stub://model".to_string(),
                ..PipelineSettings::default()
            },
        }
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn thread_worker_runs_hook_once() {
        let dir = TempDir::new().unwrap();
        let sink: Arc<dyn EventSink> = Arc::new(LocalSink::new(dir.path()).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut worker = ThreadLauncher::new(sink)
            .launch(
                job("stub://clip?frames=3&width=32&height=32"),
                CancelToken::new(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        worker.join().unwrap();
        assert!(worker.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Joining twice is harmless.
        worker.join().unwrap();
        worker.cancel();
    }

    #[test]
    fn thread_worker_stops_live_source() {
        let dir = TempDir::new().unwrap();
        let sink: Arc<dyn EventSink> = Arc::new(LocalSink::new(dir.path()).unwrap());
        let mut worker = ThreadLauncher::new(sink.clone())
            .launch(
                job("stub://live?width=32&height=32&delay_ms=5"),
                CancelToken::new(),
                Box::new(|| {}),
            )
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        worker.cancel();
        worker.join().unwrap();
        let session = sink.latest_session().unwrap().unwrap();
        assert!(session.cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn process_worker_treats_exited_child_as_stopped() {
        let launcher = ProcessLauncher::new("true");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut worker = launcher
            .launch(
                job("stub://clip?frames=1"),
                CancelToken::new(),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(10));
        }
        worker.cancel();
        worker.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn process_worker_cancel_terminates_child() {
        // Per-job arguments become unused positional parameters of the script.
        let launcher = ProcessLauncher::new("sh").with_prefix(["-c", "sleep 30", "--"]);
        let mut worker = launcher
            .launch(job("stub://clip?frames=1"), CancelToken::new(), Box::new(|| {}))
            .unwrap();
        worker.cancel();
        worker.join().unwrap();
        assert!(worker.is_finished());
    }

    #[cfg(unix)]
    #[test]
    fn process_worker_follows_cancelled_token() {
        let launcher = ProcessLauncher::new("sh").with_prefix(["-c", "sleep 30", "--"]);
        let token = CancelToken::new();
        let mut worker = launcher
            .launch(job("stub://clip?frames=1"), token.clone(), Box::new(|| {}))
            .unwrap();
        let started = std::time::Instant::now();
        token.cancel();
        worker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
