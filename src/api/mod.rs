//! HTTP/1.1 JSON control surface over a `JobController`.
//!
//! One request per connection, each connection on its own short-lived
//! thread, so a slow `start-analysis` never holds up `/status` or `/stop`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;

use crate::job::{JobController, JobError};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Relative video paths that do not exist as given are looked up here.
    pub upload_dir: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            upload_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }

    /// Block until the server thread exits.
    pub fn wait(mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }

    /// Flag the server to exit without waiting for it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<JobController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<JobController>) -> Self {
        Self { cfg, controller }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!(
            "control api listening on http://{} ({} sink)",
            addr,
            self.controller.mode().as_str()
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let controller = self.controller;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, cfg, controller, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    controller: Arc<JobController>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&cfg);
                let controller = Arc::clone(&controller);
                let spawned = std::thread::Builder::new()
                    .name("control-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &cfg, &controller) {
                            log::warn!("control api request failed: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("control api: dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(alias = "filename", alias = "video")]
    video_path: String,
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    controller: &JobController,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &json!({"error": err.to_string()}))?;
            return Ok(());
        }
    };
    log::debug!("control api: {} {}", request.method, request.path);

    let (status, body) = route(&request, cfg, controller);
    write_json_response(&mut stream, status, &body)
}

fn route(
    request: &HttpRequest,
    cfg: &ApiConfig,
    controller: &JobController,
) -> (u16, serde_json::Value) {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => (
            200,
            json!({
                "status": "ok",
                "mode": controller.mode().as_str(),
                "running": controller.status().running,
            }),
        ),
        ("POST", "/start-analysis") => start_analysis(request, cfg, controller),
        ("POST", "/stop-analysis") => {
            let outcome = controller.stop();
            let message = if outcome.stopped {
                "Analysis stopped"
            } else {
                "No analysis running"
            };
            (200, json!({"stopped": outcome.stopped, "message": message}))
        }
        ("GET", "/status") => (200, json!(controller.status())),
        ("GET", "/detections") => match controller.latest_detections() {
            Ok(latest) => (200, json!(latest)),
            Err(err) => (500, json!({"error": err.to_string()})),
        },
        ("GET", "/session") => match controller.latest_session() {
            Ok(Some(session)) => (200, json!(session)),
            Ok(None) => (200, json!({"session_id": null, "status": "no_session"})),
            Err(err) => (500, json!({"error": err.to_string()})),
        },
        ("GET", "/mode") => (200, json!({"mode": controller.mode().as_str()})),
        (
            _,
            "/health" | "/start-analysis" | "/stop-analysis" | "/status" | "/detections"
            | "/session" | "/mode",
        ) => (405, json!({"error": "method_not_allowed"})),
        _ => (404, json!({"error": "not_found"})),
    }
}

fn start_analysis(
    request: &HttpRequest,
    cfg: &ApiConfig,
    controller: &JobController,
) -> (u16, serde_json::Value) {
    let body: StartRequest = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(err) => return (400, json!({"error": format!("invalid request body: {}", err)})),
    };
    let video_ref = resolve_video(&body.video_path, cfg.upload_dir.as_deref());
    match controller.start(&video_ref) {
        Ok(started) => (
            200,
            json!({
                "message": "Analysis started",
                "session_id": started.session_id,
                "video_name": started.video_name,
            }),
        ),
        Err(err) => (error_status(&err), json!({"error": err.to_string()})),
    }
}

fn error_status(err: &JobError) -> u16 {
    match err {
        JobError::AlreadyRunning(_) | JobError::InvalidVideoRef(_) => 400,
        JobError::NotFound(_) => 404,
        JobError::Config(_) | JobError::Sink(_) | JobError::Worker(_) => 500,
    }
}

fn resolve_video(video_path: &str, upload_dir: Option<&Path>) -> String {
    let trimmed = video_path.trim();
    let direct = Path::new(trimmed);
    if direct.is_relative() && !direct.exists() && !trimmed.contains(':') {
        if let Some(dir) = upload_dir {
            let candidate = dir.join(direct);
            if candidate.exists() {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    trimmed.to_string()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
