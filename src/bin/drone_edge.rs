//! drone-edge - drone video analysis service
//!
//! Subcommands:
//! - `serve`: HTTP control API over a job controller
//! - `run`: one foreground analysis job (Ctrl-C stops it cooperatively)
//! - `clear`: erase the selected sink's current detections
//! - `check`: verify model, video, output directory and remote settings
//! - `mode`: print which sink would be used

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use drone_edge::api::{ApiConfig, ApiServer};
use drone_edge::config::{AppConfig, ENV_CONFIG};
use drone_edge::detect::check_model_path;
use drone_edge::pipeline::{self, JobSpec, PipelineSettings};
use drone_edge::sink::{EventSink, LocalSink, RemoteSink};
use drone_edge::{CancelToken, JobController, ProcessLauncher, SessionStatus, SourceRef};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Config file (TOML or JSON).
    #[arg(long, global = true, env = ENV_CONFIG)]
    config: Option<PathBuf>,
    /// Event sink (local|remote|auto). Auto picks remote when both remote
    /// settings are present.
    #[arg(long, global = true, value_enum, env = "DRONE_EDGE_SINK", default_value = "auto")]
    sink: SinkChoice,
    /// Output directory for the local sink.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Model file, or a stub:// reference.
    #[arg(long, global = true)]
    model: Option<String>,
    /// Minimum confidence kept, in [0, 1].
    #[arg(long, global = true)]
    confidence: Option<f32>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, global = true, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP control API.
    Serve {
        /// Listen address (defaults to api.addr).
        #[arg(long, env = "DRONE_EDGE_API_ADDR")]
        addr: Option<String>,
        /// Where jobs run.
        #[arg(long, value_enum, default_value = "thread")]
        worker: WorkerChoice,
    },
    /// Run one analysis job in the foreground.
    Run {
        /// Video file, camera:N, /dev/videoN, or stub:// reference.
        #[arg(long, env = "DRONE_EDGE_VIDEO")]
        video: Option<String>,
        /// Use this session id and skip clearing the sink.
        #[arg(long)]
        session_id: Option<String>,
        /// Session start time (ISO-8601); defaults to now.
        #[arg(long)]
        start_time: Option<String>,
    },
    /// Clear the selected sink.
    Clear,
    /// Verify the environment.
    Check {
        /// Video reference to verify as well.
        #[arg(long)]
        video: Option<String>,
    },
    /// Print the selected sink mode.
    Mode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SinkChoice {
    Local,
    Remote,
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WorkerChoice {
    Thread,
    Process,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var(ENV_CONFIG, path);
    }
    let mut cfg = AppConfig::load()?;
    if let Some(dir) = &cli.output_dir {
        cfg.output.dir = dir.clone();
    }
    if let Some(model) = &cli.model {
        cfg.model.path = model.clone();
    }
    if let Some(confidence) = cli.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("--confidence must be in [0, 1], got {}", confidence));
        }
        cfg.model.confidence_threshold = confidence;
    }

    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&cli.ui), is_tty, !stdout_is_tty);

    match &cli.command {
        Command::Serve { addr, worker } => serve(&cli, &cfg, addr.clone(), *worker),
        Command::Run {
            video,
            session_id,
            start_time,
        } => run(
            &cli,
            &cfg,
            &ui,
            video.clone(),
            session_id.clone(),
            start_time.clone(),
        ),
        Command::Clear => {
            let sink = build_sink(cli.sink, &cfg)?;
            sink.clear()?;
            println!("cleared {} detection data", sink.mode().as_str());
            Ok(())
        }
        Command::Check { video } => check(&cli, &cfg, &ui, video.as_deref()),
        Command::Mode => {
            println!("{}", if use_remote(cli.sink, &cfg) { "remote" } else { "local" });
            Ok(())
        }
    }
}

fn use_remote(choice: SinkChoice, cfg: &AppConfig) -> bool {
    match choice {
        SinkChoice::Local => false,
        SinkChoice::Remote => true,
        SinkChoice::Auto => cfg.remote.is_configured(),
    }
}

fn build_sink(choice: SinkChoice, cfg: &AppConfig) -> Result<Arc<dyn EventSink>> {
    if use_remote(choice, cfg) {
        let sink = RemoteSink::connect(&cfg.remote).context("connect remote sink")?;
        Ok(Arc::new(sink))
    } else {
        let sink = LocalSink::new(&cfg.output.dir)
            .with_context(|| format!("open output dir {}", cfg.output.dir.display()))?
            .with_archive(cfg.output.save_archive);
        log::info!("local sink writing to {}", cfg.output.dir.display());
        Ok(Arc::new(sink))
    }
}

fn pipeline_settings(cfg: &AppConfig) -> PipelineSettings {
    PipelineSettings {
        model_ref: cfg.model.path.clone(),
        confidence_threshold: cfg.model.confidence_threshold,
        flush_interval: cfg.flush_interval,
        log_fps: cfg.performance.log_fps,
        log_interval: cfg.performance.log_interval,
    }
}

fn serve(cli: &Cli, cfg: &AppConfig, addr: Option<String>, worker: WorkerChoice) -> Result<()> {
    let sink = build_sink(cli.sink, cfg)?;
    let mode = sink.mode();
    let settings = pipeline_settings(cfg);
    let controller = match worker {
        WorkerChoice::Thread => JobController::new(sink, settings),
        WorkerChoice::Process => {
            let launcher = ProcessLauncher::current_exe()?.with_args([
                "--sink".to_string(),
                mode.as_str().to_string(),
                "--output-dir".to_string(),
                cfg.output.dir.to_string_lossy().into_owned(),
            ]);
            JobController::with_launcher(sink, Box::new(launcher), settings)
        }
    };
    let controller = Arc::new(controller);

    let api_config = ApiConfig {
        addr: addr.unwrap_or_else(|| cfg.api.addr.clone()),
        upload_dir: Some(cfg.api.upload_dir.clone()),
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&controller)).spawn()?;
    log::info!(
        "drone-edge serving on {} ({} sink, {:?} workers)",
        api_handle.addr,
        mode.as_str(),
        worker
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("drone-edge waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    controller.shutdown()?;
    Ok(())
}

fn run(
    cli: &Cli,
    cfg: &AppConfig,
    ui: &ui::Ui,
    video: Option<String>,
    session_id: Option<String>,
    start_time: Option<String>,
) -> Result<()> {
    let video_ref = video
        .or_else(|| Some(cfg.video.input_path.clone()).filter(|v| !v.trim().is_empty()))
        .ok_or_else(|| anyhow!("no video given (use --video or video.input_path)"))?;
    let video = {
        let _stage = ui.stage("Check video");
        let video = SourceRef::parse(&video_ref)?;
        video.validate()?;
        video
    };
    let sink = {
        let _stage = ui.stage("Open sink");
        build_sink(cli.sink, cfg)?
    };
    let session_id = match session_id {
        Some(id) => id,
        None => {
            sink.clear()?;
            format!(
                "{}_{}",
                sink.mode().session_prefix(),
                drone_edge::now_unix_s()
            )
        }
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("stop requested; finishing current frame");
        handler_token.cancel();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let job = JobSpec {
        session_id,
        video_ref: video_ref.trim().to_string(),
        start_time: start_time.unwrap_or_else(drone_edge::now_iso8601),
        settings: pipeline_settings(cfg),
        video,
    };
    let mut progress = ui.progress(job.video.is_live());
    let session = pipeline::run(&job, sink.as_ref(), &cancel, &mut progress);
    progress.finish(session.status.as_str());

    println!(
        "session {}: {} ({} frames, {} detections)",
        session.session_id,
        session.status.as_str(),
        session.frame_count,
        session.total_detections
    );
    if session.status == SessionStatus::Failed {
        return Err(anyhow!("session {} failed", session.session_id));
    }
    Ok(())
}

fn check(cli: &Cli, cfg: &AppConfig, ui: &ui::Ui, video: Option<&str>) -> Result<()> {
    let mut failures = Vec::new();

    {
        let _stage = ui.stage("Model");
        if cfg.model.path.starts_with("stub://") {
            println!("model: {} (stub backend)", cfg.model.path);
        } else {
            match check_model_path(&cfg.model.path) {
                Ok(path) => println!("model: {} found", path.display()),
                Err(err) => failures.push(format!("model: {}", err)),
            }
        }
    }

    let video = video
        .map(str::to_string)
        .or_else(|| Some(cfg.video.input_path.clone()).filter(|v| !v.trim().is_empty()));
    if let Some(video) = video {
        let _stage = ui.stage("Video");
        match SourceRef::parse(&video).and_then(|r| r.validate().map(|_| r)) {
            Ok(reference) => println!("video: {} ok", reference.display_name()),
            Err(err) => failures.push(format!("video: {}", err)),
        }
    }

    {
        let _stage = ui.stage("Output directory");
        let writable = std::fs::create_dir_all(&cfg.output.dir)
            .and_then(|_| tempfile::NamedTempFile::new_in(&cfg.output.dir).map(|_| ()));
        match writable {
            Ok(()) => println!("output: {} writable", cfg.output.dir.display()),
            Err(err) => failures.push(format!(
                "output: {} not writable: {}",
                cfg.output.dir.display(),
                err
            )),
        }
    }

    {
        let _stage = ui.stage("Remote sink");
        if use_remote(cli.sink, cfg) {
            match RemoteSink::connect(&cfg.remote) {
                Ok(_) => println!("remote: reachable"),
                Err(err) => failures.push(format!("remote: {}", err)),
            }
        } else if cfg.remote.is_configured() {
            println!("remote: configured (not selected)");
        } else {
            println!("remote: not configured, using local sink");
        }
    }

    if failures.is_empty() {
        println!("all checks passed");
        Ok(())
    } else {
        for failure in &failures {
            eprintln!("FAIL {}", failure);
        }
        Err(anyhow!("{} check(s) failed", failures.len()))
    }
}
