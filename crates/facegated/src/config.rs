use facegate_core::cascade::{MIN_NEIGHBORS, SCALE_FACTOR};
use facegate_core::pipeline::CONFIDENCE_THRESHOLD;
use facegate_core::FaceSelection;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_CASCADE_PATH: &str =
    "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";
const MODEL_RELATIVE_PATH: &str = "public/models/face_classifier.onnx";
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind: SocketAddr,
    /// ONNX classifier model file.
    pub model_path: PathBuf,
    /// OpenCV Haar cascade XML file.
    pub cascade_path: PathBuf,
    /// Optional TOML label map replacing the built-in one.
    pub labels_path: Option<PathBuf>,
    /// Minimum top-1 score (exclusive) for a positive identification.
    pub confidence_threshold: f32,
    /// Pyramid step between detection scales.
    pub scale_factor: f64,
    /// Neighbouring detections a face needs to survive grouping.
    pub min_neighbors: usize,
    pub face_selection: FaceSelection,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let bind = std::env::var("FACEGATE_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));

        let model_path = std::env::var("FACEGATE_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| install_dir().join(MODEL_RELATIVE_PATH));

        let cascade_path = std::env::var("FACEGATE_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CASCADE_PATH));

        let face_selection = match std::env::var("FACEGATE_FACE_SELECTION") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring FACEGATE_FACE_SELECTION");
                FaceSelection::First
            }),
            Err(_) => FaceSelection::First,
        };

        Self {
            bind,
            model_path,
            cascade_path,
            labels_path: std::env::var("FACEGATE_LABELS_PATH").ok().map(PathBuf::from),
            confidence_threshold: env_parse("FACEGATE_CONFIDENCE_THRESHOLD", CONFIDENCE_THRESHOLD),
            scale_factor: env_parse("FACEGATE_SCALE_FACTOR", SCALE_FACTOR),
            min_neighbors: env_parse("FACEGATE_MIN_NEIGHBORS", MIN_NEIGHBORS),
            face_selection,
            max_body_bytes: env_parse("FACEGATE_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
        }
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }

    pub fn cascade_path_str(&self) -> String {
        self.cascade_path.to_string_lossy().into_owned()
    }
}

/// Directory holding the running executable; falls back to the working directory.
fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
