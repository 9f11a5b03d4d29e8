use athlens_core::cascade::ScanParams;
use athlens_core::classifier::DEFAULT_INTRA_THREADS;
use athlens_core::preprocess::DEFAULT_MODEL_CHANNEL_ORDER;
use athlens_core::types::ChannelOrder;
use athlens_core::PipelineConfig;
use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the classifier and both cascades.
    pub model_dir: PathBuf,
    /// Classifier model (default: `<model_dir>/athlete_resnet18.onnx`).
    pub model_path: PathBuf,
    /// Frontal-face cascade (default: `<model_dir>/haarcascade_frontalface_default.xml`).
    pub face_cascade_path: PathBuf,
    /// Eye cascade (default: `<model_dir>/haarcascade_eye.xml`).
    pub eye_cascade_path: PathBuf,
    /// ONNX Runtime intra-op threads per inference.
    pub intra_threads: usize,
    /// Channel order the classifier expects.
    pub model_channel_order: ChannelOrder,
    /// Cascade pyramid step.
    pub scale_factor: f64,
    /// Cascade neighbour threshold.
    pub min_neighbors: usize,
    /// Upper bound on images processed at once.
    pub max_concurrency: usize,
}

impl Config {
    /// Load configuration from `ATHLENS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = get("ATHLENS_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(athlens_core::default_model_dir);
        let defaults = ScanParams::default();

        let file_or = |key: &str, name: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.join(name))
        };

        Self {
            model_path: file_or("ATHLENS_WEIGHTS_FILE", athlens_core::MODEL_FILE),
            face_cascade_path: file_or("ATHLENS_FACE_CASCADE", athlens_core::FACE_CASCADE_FILE),
            eye_cascade_path: file_or("ATHLENS_EYE_CASCADE", athlens_core::EYE_CASCADE_FILE),
            intra_threads: parse_or(&get, "ATHLENS_INTRA_THREADS", DEFAULT_INTRA_THREADS),
            model_channel_order: parse_or(&get, "ATHLENS_MODEL_CHANNEL_ORDER", DEFAULT_MODEL_CHANNEL_ORDER),
            scale_factor: parse_or(&get, "ATHLENS_SCALE_FACTOR", defaults.scale_factor),
            min_neighbors: parse_or(&get, "ATHLENS_MIN_NEIGHBORS", defaults.min_neighbors),
            max_concurrency: parse_or(&get, "ATHLENS_MAX_CONCURRENCY", default_concurrency()),
            model_dir,
        }
    }

    /// Move to a new model directory. Files still at their default location
    /// under the old directory follow it; explicitly configured files stay put.
    pub fn set_model_dir(&mut self, dir: PathBuf) {
        for (path, name) in [
            (&mut self.model_path, athlens_core::MODEL_FILE),
            (&mut self.face_cascade_path, athlens_core::FACE_CASCADE_FILE),
            (&mut self.eye_cascade_path, athlens_core::EYE_CASCADE_FILE),
        ] {
            if *path == self.model_dir.join(name) {
                *path = dir.join(name);
            }
        }
        self.model_dir = dir;
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            model_path: self.model_path.clone(),
            face_cascade_path: self.face_cascade_path.clone(),
            eye_cascade_path: self.eye_cascade_path.clone(),
            intra_threads: self.intra_threads.max(1),
            model_channel_order: self.model_channel_order,
            scan: ScanParams {
                scale_factor: self.scale_factor,
                min_neighbors: self.min_neighbors,
                ..ScanParams::default()
            },
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}
