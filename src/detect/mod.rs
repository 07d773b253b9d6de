mod backend;
mod backends;
mod engine;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{check_model_path, DetectionEngine, EngineError, LATENCY_WINDOW, WARMUP_FRAME_SIZE};
pub use result::{BoundingBox, Candidate, Detection};
