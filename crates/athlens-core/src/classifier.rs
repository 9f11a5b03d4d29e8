//! Athlete classifier via ONNX Runtime.
//!
//! Runs a ResNet-18 whose final fully-connected layer was retrained to
//! [`CLASS_COUNT`] outputs, then turns the logits into a probability
//! distribution over [`ClassLabel`].

use crate::preprocess::{NormalizedTensor, INPUT_SIZE};
use crate::types::{ClassLabel, Distribution, PredictionResult, CLASS_COUNT};
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const DEFAULT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model weights not found: {0}")]
    NotFound(String),
    #[error("model shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("probe inference failed: {0}")]
    Probe(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced {actual} logits, expected {expected}")]
    LogitCount { expected: usize, actual: usize },
    #[error("model produced non-finite logits")]
    NonFinite,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Forward pass: normalised input → one logit per [`ClassLabel`].
///
/// Implementations must be callable from many threads at once and must not
/// change observable state between calls.
pub trait LogitModel: Send + Sync {
    fn logits(&self, input: &NormalizedTensor) -> Result<Vec<f32>, ClassifierError>;
}

/// The classifier network, loaded once and shared read-only.
pub struct LoadedModel {
    // ort sessions need exclusive access per run.
    session: Mutex<Session>,
    path: String,
}

impl LoadedModel {
    /// Load an exported classifier and verify it matches the fixed architecture.
    ///
    /// The file must hold the complete inference graph and weights. Exported
    /// graphs are already in inference mode (no dropout, frozen batch-norm).
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ModelLoadError> {
        if !Path::new(model_path).exists() {
            return Err(ModelLoadError::NotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded classifier model"
        );

        check_declared_shapes(&session)?;

        let model = Self {
            session: Mutex::new(session),
            path: model_path.to_string(),
        };
        // Dynamic output dims can only be confirmed by running the graph.
        verify_output_width(&model)?;

        Ok(model)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl LogitModel for LoadedModel {
    fn logits(&self, input: &NormalizedTensor) -> Result<Vec<f32>, ClassifierError> {
        let mut session = lock_shared(&self.session);

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("logit extraction: {e}")))?;

        if raw.len() != CLASS_COUNT {
            return Err(ClassifierError::LogitCount {
                expected: CLASS_COUNT,
                actual: raw.len(),
            });
        }
        Ok(raw.to_vec())
    }
}

/// Lock a mutex, recovering the guard if an earlier holder panicked.
///
/// A run either completes or leaves the session untouched, so a poisoned lock
/// carries no partial state.
fn lock_shared<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Load the classifier with the default thread count.
pub fn load_model(model_path: &str) -> Result<LoadedModel, ModelLoadError> {
    LoadedModel::load(model_path, DEFAULT_INTRA_THREADS)
}

/// A declared dimension matches if it is symbolic (negative) or equal.
fn dim_matches(declared: i64, expected: usize) -> bool {
    declared < 0 || declared as usize == expected
}

fn check_input_dims(dims: &[i64]) -> Result<(), ModelLoadError> {
    let ok = dims.len() == 4
        && dim_matches(dims[0], 1)
        && dim_matches(dims[1], 3)
        && dim_matches(dims[2], INPUT_SIZE)
        && dim_matches(dims[3], INPUT_SIZE);
    if !ok {
        return Err(ModelLoadError::ShapeMismatch(format!(
            "input declared as {dims:?}, expected [N, 3, {INPUT_SIZE}, {INPUT_SIZE}]"
        )));
    }
    Ok(())
}

fn check_output_dims(dims: &[i64]) -> Result<(), ModelLoadError> {
    match dims.last() {
        Some(&width) if dim_matches(width, CLASS_COUNT) => Ok(()),
        _ => Err(ModelLoadError::ShapeMismatch(format!(
            "output declared as {dims:?}, expected [N, {CLASS_COUNT}]"
        ))),
    }
}

fn check_declared_shapes(session: &Session) -> Result<(), ModelLoadError> {
    let input = session
        .inputs()
        .first()
        .ok_or_else(|| ModelLoadError::ShapeMismatch("model declares no inputs".into()))?;
    if let ValueType::Tensor { shape, .. } = input.dtype() {
        check_input_dims(shape)?;
    }

    let output = session
        .outputs()
        .first()
        .ok_or_else(|| ModelLoadError::ShapeMismatch("model declares no outputs".into()))?;
    if let ValueType::Tensor { shape, .. } = output.dtype() {
        check_output_dims(shape)?;
    }
    Ok(())
}

/// Run one all-zero input through the model and confirm the logit count.
fn verify_output_width(model: &dyn LogitModel) -> Result<(), ModelLoadError> {
    match model.logits(&NormalizedTensor::zeros()) {
        Ok(_) => Ok(()),
        Err(ClassifierError::LogitCount { expected, actual }) => Err(ModelLoadError::ShapeMismatch(
            format!("model produces {actual} outputs, expected {expected}"),
        )),
        Err(e) => Err(ModelLoadError::Probe(e.to_string())),
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Score one face tensor.
///
/// The label is chosen from the unrounded probabilities; the reported
/// distribution is rounded to 3 decimals.
pub fn classify(model: &dyn LogitModel, tensor: &NormalizedTensor) -> Result<PredictionResult, ClassifierError> {
    let logits = model.logits(tensor)?;
    if logits.len() != CLASS_COUNT {
        return Err(ClassifierError::LogitCount {
            expected: CLASS_COUNT,
            actual: logits.len(),
        });
    }
    if logits.iter().any(|l| !l.is_finite()) {
        return Err(ClassifierError::NonFinite);
    }

    let mut probabilities = [0.0f32; CLASS_COUNT];
    probabilities.copy_from_slice(&softmax(&logits));

    let best = argmax(&probabilities).unwrap_or(0);
    let label = ClassLabel::ALL[best];

    tracing::debug!(
        label = %label,
        confidence = probabilities[best],
        ?logits,
        "face classified"
    );

    Ok(PredictionResult {
        label,
        distribution: Distribution::from_probabilities(&probabilities),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedLogits(Vec<f32>);

    impl LogitModel for FixedLogits {
        fn logits(&self, _input: &NormalizedTensor) -> Result<Vec<f32>, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let p = softmax(&[1000.0, 1000.0, -1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[1] - 0.5).abs() < 1e-6);
        assert!(p[2].abs() < 1e-6);
    }

    #[test]
    fn test_lock_survives_panicked_holder() {
        let shared = std::sync::Arc::new(Mutex::new(7u32));
        let held = std::sync::Arc::clone(&shared);
        let crashed = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("request failed mid-inference");
        })
        .join();
        assert!(crashed.is_err());
        assert!(shared.is_poisoned());

        *lock_shared(&shared) += 1;
        assert_eq!(*lock_shared(&shared), 8);
    }

    #[test]
    fn test_argmax_tie_prefers_lowest_index() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some(1));
        assert_eq!(argmax(&[0.2, 0.2, 0.2, 0.2, 0.2]), Some(0));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_classify_distribution() {
        let model = FixedLogits(vec![0.5, 3.0, -1.0, 0.0, 1.2]);
        let result = classify(&model, &NormalizedTensor::zeros()).unwrap();

        assert_eq!(result.label, ClassLabel::ErlingHaaland);
        let values: Vec<f64> = result.distribution.iter().map(|(_, p)| p).collect();
        assert_eq!(values.len(), CLASS_COUNT);
        assert!(values.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert!((result.distribution.sum() - 1.0).abs() <= 0.005);
        for &p in &values {
            assert!(((p * 1000.0).round() - p * 1000.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_classify_tie_picks_first_label() {
        let model = FixedLogits(vec![0.0, 2.0, 0.0, 2.0, 1.0]);
        let result = classify(&model, &NormalizedTensor::zeros()).unwrap();
        assert_eq!(result.label, ClassLabel::ErlingHaaland);

        let uniform = FixedLogits(vec![0.0; CLASS_COUNT]);
        let result = classify(&uniform, &NormalizedTensor::zeros()).unwrap();
        assert_eq!(result.label, ClassLabel::CristianoRonaldo);
        assert!((result.distribution.get(ClassLabel::NeymarJr) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_classify_wrong_width() {
        let model = FixedLogits(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            classify(&model, &NormalizedTensor::zeros()),
            Err(ClassifierError::LogitCount { expected: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_classify_non_finite() {
        let model = FixedLogits(vec![f32::NAN, 0.0, 0.0, 0.0, 0.0]);
        assert!(matches!(
            classify(&model, &NormalizedTensor::zeros()),
            Err(ClassifierError::NonFinite)
        ));
    }

    #[test]
    fn test_declared_dims() {
        assert!(check_input_dims(&[1, 3, 224, 224]).is_ok());
        assert!(check_input_dims(&[-1, 3, 224, 224]).is_ok());
        assert!(check_input_dims(&[1, 3, 112, 112]).is_err());
        assert!(check_input_dims(&[1, 224, 224, 3]).is_err());
        assert!(check_output_dims(&[-1, 5]).is_ok());
        assert!(check_output_dims(&[1, -1]).is_ok());
        assert!(check_output_dims(&[1, 1000]).is_err());
        assert!(check_output_dims(&[]).is_err());
    }

    #[test]
    fn test_verify_output_width_rejects_wrong_head() {
        let wrong = FixedLogits(vec![0.0; 1000]);
        // FixedLogits bypasses the width check in LoadedModel::logits, so
        // mirror it here the way classify does.
        struct Checked(FixedLogits);
        impl LogitModel for Checked {
            fn logits(&self, input: &NormalizedTensor) -> Result<Vec<f32>, ClassifierError> {
                let l = self.0.logits(input)?;
                if l.len() != CLASS_COUNT {
                    return Err(ClassifierError::LogitCount {
                        expected: CLASS_COUNT,
                        actual: l.len(),
                    });
                }
                Ok(l)
            }
        }
        assert!(matches!(
            verify_output_width(&Checked(wrong)),
            Err(ModelLoadError::ShapeMismatch(_))
        ));
        assert!(verify_output_width(&FixedLogits(vec![0.0; CLASS_COUNT])).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_model("/nonexistent/athlete_resnet18.onnx"),
            Err(ModelLoadError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_corrupt_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\x01 this is not a protobuf graph").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let result = load_model(&path);
        assert!(result.is_err());
        assert!(!matches!(result, Err(ModelLoadError::NotFound(_))));
    }

    // --- Minimal protobuf writer for a hand-built ONNX graph ---

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        while v >= 0x80 {
            out.push((v as u8) | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
    }

    fn int_field(field: u64, v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        varint(field << 3, &mut out);
        varint(v, &mut out);
        out
    }

    fn bytes_field(field: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        varint((field << 3) | 2, &mut out);
        varint(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn float_tensor_info(name: &str, dims: &[u64]) -> Vec<u8> {
        let shape: Vec<u8> = dims
            .iter()
            .flat_map(|&d| bytes_field(1, &int_field(1, d)))
            .collect();
        let tensor_type = [int_field(1, 1), bytes_field(2, &shape)].concat();
        let type_proto = bytes_field(1, &tensor_type);
        [bytes_field(1, name.as_bytes()), bytes_field(2, &type_proto)].concat()
    }

    /// ONNX model that flattens the image: output width 150528 instead of 5.
    fn flatten_model() -> Vec<u8> {
        let node = [
            bytes_field(1, b"x"),
            bytes_field(2, b"y"),
            bytes_field(3, b"flatten"),
            bytes_field(4, b"Flatten"),
        ]
        .concat();
        let graph = [
            bytes_field(1, &node),
            bytes_field(2, b"wrong_head"),
            bytes_field(11, &float_tensor_info("x", &[1, 3, 224, 224])),
            bytes_field(12, &float_tensor_info("y", &[1, 3 * 224 * 224])),
        ]
        .concat();
        let opset = [bytes_field(1, b""), int_field(2, 13)].concat();
        [
            int_field(1, 8),
            bytes_field(2, b"athlens-test"),
            bytes_field(7, &graph),
            bytes_field(8, &opset),
        ]
        .concat()
    }

    #[test]
    fn test_load_rejects_wrong_output_width() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&flatten_model()).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            load_model(&path),
            Err(ModelLoadError::ShapeMismatch(_))
        ));
    }
}
