use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    /// Path to the persisted gallery file.
    pub gallery_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Initial confidence threshold for a positive match.
    pub confidence_threshold: f32,
    /// Expected embedding dimensionality for a fresh gallery.
    pub embedding_dim: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let gallery_path = std::env::var("ROLLCALL_GALLERY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.json"));

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        Self {
            db_path,
            gallery_path,
            model_dir,
            confidence_threshold: env_f32("ROLLCALL_CONFIDENCE_THRESHOLD", 0.6),
            embedding_dim: env_usize(
                "ROLLCALL_EMBEDDING_DIM",
                rollcall_core::DEFAULT_EMBEDDING_DIM,
            ),
        }
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_320.onnx")
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("mfn_128_v2.onnx")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
