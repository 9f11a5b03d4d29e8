//! athlens-core — Athlete recognition from a single photograph.
//!
//! Finds the first frontal face with two visible eyes using Haar cascades,
//! then classifies it with a ResNet-18 running via ONNX Runtime.

pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod pipeline;
pub mod preprocess;
pub mod types;

pub use classifier::{classify, load_model, LoadedModel, LogitModel};
pub use detector::{FaceCandidateDetector, RegionDetector};
pub use pipeline::{run_pipeline, Outcome, Pipeline, PipelineConfig};
pub use preprocess::{NormalizedTensor, Preprocessor};
pub use types::{ClassLabel, FaceCandidate, PredictionResult, RawImage, Region};

use std::path::PathBuf;

pub const MODEL_FILE: &str = "athlete_resnet18.onnx";
pub const FACE_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EYE_CASCADE_FILE: &str = "haarcascade_eye.xml";

/// `$XDG_DATA_HOME/athlens/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("athlens")
        .join("models")
}
