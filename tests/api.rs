use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use tempfile::TempDir;

use drone_edge::api::{ApiConfig, ApiHandle, ApiServer};
use drone_edge::worker::ExitHook;
use drone_edge::{
    CancelToken, JobController, JobError, JobSpec, LocalSink, PipelineSettings, ThreadLauncher,
    Worker, WorkerLauncher,
};

fn controller(dir: &TempDir) -> Arc<JobController> {
    let sink = Arc::new(LocalSink::new(dir.path().join("output")).unwrap());
    Arc::new(JobController::new(
        sink,
        PipelineSettings {
            model_ref: "stub://model?detect=2:2:0.9".to_string(),
            ..PipelineSettings::default()
        },
    ))
}

fn request(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Result<(u16, Value)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let body = body.unwrap_or("");
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(req.as_bytes())?;
    let mut resp = String::new();
    stream.read_to_string(&mut resp)?;
    let status: u16 = resp
        .split_whitespace()
        .nth(1)
        .unwrap_or("0")
        .parse()
        .unwrap_or(0);
    let body = resp.split("\r\n\r\n").nth(1).unwrap_or("");
    let value = serde_json::from_str(body).unwrap_or(Value::Null);
    Ok((status, value))
}

fn spawn(controller: Arc<JobController>, upload_dir: Option<PathBuf>) -> Result<ApiHandle> {
    ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            upload_dir,
        },
        controller,
    )
    .spawn()
}

#[test]
fn start_poll_and_read_session() -> Result<()> {
    let dir = TempDir::new()?;
    let controller = controller(&dir);
    let handle = spawn(Arc::clone(&controller), None)?;
    let addr = handle.addr;

    let (status, body) = request(addr, "GET", "/health", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["mode"], "local");
    assert_eq!(body["running"], false);

    let (status, body) = request(addr, "GET", "/session", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "no_session");

    let (status, body) = request(
        addr,
        "POST",
        "/start-analysis",
        Some(r#"{"video_path": "stub://clip?frames=4"}"#),
    )?;
    assert_eq!(status, 200);
    let session_id = body["session_id"].as_str().unwrap_or_default().to_string();
    assert!(session_id.starts_with("local_"));
    assert_eq!(body["video_name"], "stub://clip");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (_, status_body) = request(addr, "GET", "/status", None)?;
        if status_body["running"] == false {
            break;
        }
        assert!(Instant::now() < deadline, "job did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
    controller.wait()?;

    let (status, body) = request(addr, "GET", "/detections", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["session_id"], session_id.as_str());
    let detections = body["detections"].as_array().cloned().unwrap_or_default();
    assert_eq!(detections.len(), 4);
    assert_eq!(detections[1]["detection_count"], 1);
    assert_eq!(detections[1]["detections"][0]["class_name"], "Late Blight");

    let (status, body) = request(addr, "GET", "/session", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["frame_count"], 4);
    assert_eq!(body["total_detections"], 1);

    handle.stop()?;
    Ok(())
}

#[test]
fn rejects_bad_requests() -> Result<()> {
    let dir = TempDir::new()?;
    let controller = controller(&dir);
    let handle = spawn(Arc::clone(&controller), None)?;
    let addr = handle.addr;

    let (status, _) = request(addr, "POST", "/start-analysis", Some("not json"))?;
    assert_eq!(status, 400);

    let (status, body) = request(
        addr,
        "POST",
        "/start-analysis",
        Some(r#"{"video_path": "notes.txt"}"#),
    )?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap_or_default().contains("unsupported"));

    let (status, _) = request(
        addr,
        "POST",
        "/start-analysis",
        Some(r#"{"video_path": "/nonexistent/clip.mp4"}"#),
    )?;
    assert_eq!(status, 404);

    let (status, _) = request(addr, "GET", "/start-analysis", None)?;
    assert_eq!(status, 405);
    let (status, _) = request(addr, "GET", "/nope", None)?;
    assert_eq!(status, 404);

    handle.stop()?;
    Ok(())
}

#[test]
fn second_start_conflicts_and_stop_ends_job() -> Result<()> {
    let dir = TempDir::new()?;
    let controller = controller(&dir);
    let handle = spawn(Arc::clone(&controller), None)?;
    let addr = handle.addr;

    let (status, _) = request(
        addr,
        "POST",
        "/start-analysis",
        Some(r#"{"video_path": "stub://live?delay_ms=10"}"#),
    )?;
    assert_eq!(status, 200);
    let (status, body) = request(
        addr,
        "POST",
        "/start-analysis",
        Some(r#"{"video_path": "stub://clip?frames=2"}"#),
    )?;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap_or_default().contains("already running"));

    let (status, body) = request(addr, "POST", "/stop-analysis", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["stopped"], true);
    let (_, body) = request(addr, "GET", "/status", None)?;
    assert_eq!(body["running"], false);

    let (status, body) = request(addr, "POST", "/stop-analysis", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["stopped"], false);

    controller.wait()?;
    let (_, body) = request(addr, "GET", "/session", None)?;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["cancelled"], true);

    handle.stop()?;
    Ok(())
}

#[test]
fn relative_names_resolve_against_upload_dir() -> Result<()> {
    let dir = TempDir::new()?;
    let uploads = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads)?;
    std::fs::write(uploads.join("field.mp4"), b"not really a video")?;
    let controller = controller(&dir);
    let handle = spawn(Arc::clone(&controller), Some(uploads))?;

    let (status, body) = request(
        handle.addr,
        "POST",
        "/start-analysis",
        Some(r#"{"filename": "field.mp4"}"#),
    )?;
    assert_eq!(status, 200);
    assert_eq!(body["video_name"], "field.mp4");

    controller.wait()?;
    let (_, body) = request(handle.addr, "GET", "/session", None)?;
    assert_eq!(body["status"], "failed");

    handle.stop()?;
    Ok(())
}

/// Launcher that takes its time before handing off to a thread.
struct SlowLauncher {
    inner: ThreadLauncher,
    delay: Duration,
}

impl WorkerLauncher for SlowLauncher {
    fn launch(
        &self,
        job: JobSpec,
        cancel: CancelToken,
        on_exit: ExitHook,
    ) -> Result<Box<dyn Worker>, JobError> {
        std::thread::sleep(self.delay);
        self.inner.launch(job, cancel, on_exit)
    }
}

#[test]
fn status_answers_while_start_is_in_progress() -> Result<()> {
    let dir = TempDir::new()?;
    let sink = Arc::new(LocalSink::new(dir.path().join("output"))?);
    let launcher = SlowLauncher {
        inner: ThreadLauncher::new(sink.clone()),
        delay: Duration::from_millis(1500),
    };
    let controller = Arc::new(JobController::with_launcher(
        sink,
        Box::new(launcher),
        PipelineSettings {
            model_ref: "stub://model".to_string(),
            ..PipelineSettings::default()
        },
    ));
    let handle = spawn(Arc::clone(&controller), None)?;
    let addr = handle.addr;

    let starter = std::thread::spawn(move || {
        request(
            addr,
            "POST",
            "/start-analysis",
            Some(r#"{"video_path": "stub://clip?frames=2"}"#),
        )
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while !controller.status().running && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let asked = Instant::now();
    let (status, body) = request(addr, "GET", "/status", None)?;
    assert_eq!(status, 200);
    assert_eq!(body["running"], true);
    assert!(asked.elapsed() < Duration::from_millis(1000));

    let (status, _) = starter.join().expect("start request thread")?;
    assert_eq!(status, 200);
    controller.wait()?;
    handle.stop()?;
    Ok(())
}
