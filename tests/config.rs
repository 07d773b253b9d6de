use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use drone_edge::config::AppConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DRONE_EDGE_CONFIG",
        "DRONE_EDGE_MODEL",
        "DRONE_EDGE_CONFIDENCE",
        "DRONE_EDGE_VIDEO",
        "DRONE_EDGE_OUTPUT_DIR",
        "DRONE_EDGE_API_ADDR",
        "FIREBASE_DATABASE_URL",
        "FIREBASE_AUTH_TOKEN",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = AppConfig::load().expect("load defaults");
    assert_eq!(cfg.model.path, "models/best.onnx");
    assert!((cfg.model.confidence_threshold - 0.25).abs() < f32::EPSILON);
    assert_eq!(cfg.output.dir, PathBuf::from("output"));
    assert!(cfg.output.save_archive);
    assert_eq!(cfg.performance.log_interval, 30);
    assert_eq!(cfg.flush_interval, 10);
    assert_eq!(cfg.api.addr, "127.0.0.1:5000");
    assert!(!cfg.remote.is_configured());
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "model": { "path": "models/field.onnx", "confidence_threshold": 0.4 },
            "video": { "input_path": "video/field.mp4" },
            "output": { "dir": "/tmp/drone-out", "save_archive": false },
            "performance": { "log_fps": false, "log_interval": 15 },
            "session": { "flush_interval": 5 },
            "remote": { "database_url": "https://farm.example.com", "timeout_secs": 3 }
        }"#,
    );
    std::env::set_var("DRONE_EDGE_CONFIG", file.path());
    std::env::set_var("DRONE_EDGE_CONFIDENCE", "0.6");
    std::env::set_var("FIREBASE_AUTH_TOKEN", "secret");

    let cfg = AppConfig::load().expect("load config");
    assert_eq!(cfg.model.path, "models/field.onnx");
    assert!((cfg.model.confidence_threshold - 0.6).abs() < f32::EPSILON);
    assert_eq!(cfg.video.input_path, "video/field.mp4");
    assert_eq!(cfg.output.dir, PathBuf::from("/tmp/drone-out"));
    assert!(!cfg.output.save_archive);
    assert!(!cfg.performance.log_fps);
    assert_eq!(cfg.performance.log_interval, 15);
    assert_eq!(cfg.flush_interval, 5);
    assert_eq!(cfg.remote.timeout, Duration::from_secs(3));
    assert!(cfg.remote.is_configured());
    assert!(!format!("{:?}", cfg.remote).contains("secret"));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[model]
path = "stub://model"

[api]
addr = "127.0.0.1:5055"
upload_dir = "uploads"
"#,
    );
    std::env::set_var("DRONE_EDGE_CONFIG", file.path());
    std::env::set_var("DRONE_EDGE_OUTPUT_DIR", "/tmp/override");

    let cfg = AppConfig::load().expect("load config");
    assert_eq!(cfg.model.path, "stub://model");
    assert_eq!(cfg.api.addr, "127.0.0.1:5055");
    assert_eq!(cfg.api.upload_dir, PathBuf::from("uploads"));
    assert_eq!(cfg.output.dir, PathBuf::from("/tmp/override"));

    clear_env();
}

#[test]
fn rejects_out_of_range_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", r#"{ "model": { "confidence_threshold": 1.5 } }"#);
    std::env::set_var("DRONE_EDGE_CONFIG", file.path());
    let err = AppConfig::load().unwrap_err();
    assert!(err.to_string().contains("confidence_threshold"));

    std::env::set_var("DRONE_EDGE_CONFIG", "");
    std::env::set_var("DRONE_EDGE_CONFIDENCE", "high");
    assert!(AppConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unknown_sections_and_zero_intervals() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", r#"{ "rtsp": { "url": "rtsp://cam" } }"#);
    std::env::set_var("DRONE_EDGE_CONFIG", file.path());
    assert!(AppConfig::load().is_err());

    let file = config_file(".json", r#"{ "session": { "flush_interval": 0 } }"#);
    std::env::set_var("DRONE_EDGE_CONFIG", file.path());
    let err = AppConfig::load().unwrap_err();
    assert!(err.to_string().contains("flush_interval"));

    clear_env();
}
