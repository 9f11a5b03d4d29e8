//! Request pipeline: bytes → decoded image → face candidate → tensor → prediction.

use crate::cascade::{CascadeError, ScanParams};
use crate::classifier::{self, ClassifierError, LoadedModel, LogitModel, ModelLoadError};
use crate::detector::FaceCandidateDetector;
use crate::preprocess::{PreprocessError, Preprocessor};
use crate::types::{ChannelOrder, DecodeError, PredictionResult, RawImage};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Advisory returned when no face passes the eye filter.
pub const NO_FACE_MESSAGE: &str = "Failed to process the image. This could be due to one of the \
following reasons: the image may not contain a clearly visible face with both eyes, or the image \
resolution might be too low for accurate face and eye detection. Please try again with a different image.";

/// Startup failures. The pipeline must not serve requests without all of its parts.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("classifier: {0}")]
    Model(#[from] ModelLoadError),
    #[error("detector: {0}")]
    Cascade(#[from] CascadeError),
}

/// Per-request failures. None of these affect other requests or the shared model.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
}

/// The two normal results of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Prediction(PredictionResult),
    NoFaceFound,
}

impl Outcome {
    pub fn prediction(&self) -> Option<&PredictionResult> {
        match self {
            Outcome::Prediction(p) => Some(p),
            Outcome::NoFaceFound => None,
        }
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Outcome::Prediction(p) => p.serialize(serializer),
            Outcome::NoFaceFound => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("message", NO_FACE_MESSAGE)?;
                map.end()
            }
        }
    }
}

/// Filesystem locations and tuning for everything the pipeline loads at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model_path: PathBuf,
    pub face_cascade_path: PathBuf,
    pub eye_cascade_path: PathBuf,
    pub intra_threads: usize,
    pub model_channel_order: ChannelOrder,
    pub scan: ScanParams,
}

/// Detector, preprocessor and classifier, wired together.
///
/// Holds only immutable state after construction; share it across threads
/// behind an `Arc`.
pub struct Pipeline {
    detector: FaceCandidateDetector,
    preprocessor: Preprocessor,
    model: Arc<dyn LogitModel>,
}

impl Pipeline {
    pub fn new(detector: FaceCandidateDetector, preprocessor: Preprocessor, model: Arc<dyn LogitModel>) -> Self {
        Self {
            detector,
            preprocessor,
            model,
        }
    }

    /// Load the classifier and both cascades. Fails fast on the first missing piece.
    pub fn load(config: &PipelineConfig) -> Result<Self, LoadError> {
        let model = LoadedModel::load(&config.model_path.to_string_lossy(), config.intra_threads)?;
        let detector = FaceCandidateDetector::load(
            &config.face_cascade_path.to_string_lossy(),
            &config.eye_cascade_path.to_string_lossy(),
            config.scan,
        )?;
        tracing::info!(
            model = %config.model_path.display(),
            channel_order = ?config.model_channel_order,
            "pipeline ready"
        );
        Ok(Self::new(
            detector,
            Preprocessor::new(config.model_channel_order),
            Arc::new(model),
        ))
    }

    pub fn detector(&self) -> &FaceCandidateDetector {
        &self.detector
    }

    /// Decode and classify one uploaded image.
    pub fn run(&self, image_bytes: &[u8]) -> Result<Outcome, PipelineError> {
        let image = RawImage::decode(image_bytes)?;
        tracing::debug!(width = image.width(), height = image.height(), "image decoded");
        self.run_image(&image)
    }

    /// Classify an already decoded image.
    pub fn run_image(&self, image: &RawImage) -> Result<Outcome, PipelineError> {
        let Some(candidate) = self.detector.find_face_candidate(image) else {
            tracing::debug!("no face with both eyes visible");
            return Ok(Outcome::NoFaceFound);
        };
        tracing::debug!(region = ?candidate.region, eyes = candidate.eyes.len(), "face candidate selected");

        let tensor = self.preprocessor.preprocess(&candidate)?;
        let prediction = classifier::classify(self.model.as_ref(), &tensor)?;
        Ok(Outcome::Prediction(prediction))
    }
}

/// Run one request against a shared pipeline.
pub fn run_pipeline(pipeline: &Pipeline, image_bytes: &[u8]) -> Result<Outcome, PipelineError> {
    pipeline.run(image_bytes)
}
