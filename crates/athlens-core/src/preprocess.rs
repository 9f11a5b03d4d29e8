//! Face crop → classifier input tensor.
//!
//! Scales to [0, 1], resizes the shorter side to 256 with antialiased bilinear
//! filtering, centre-crops 224×224 and applies ImageNet channel statistics.

use crate::types::{ChannelOrder, FaceCandidate, RawImage, DETECTOR_CHANNEL_ORDER};
use ndarray::{Array3, Array4, ArrayView4};
use thiserror::Error;

// --- Named constants (must match the classifier's training transforms) ---
pub const INPUT_SIZE: usize = 224;
pub const RESIZE_SHORT_SIDE: usize = 256;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Channel order fed to the network unless configured otherwise. The crop is
/// passed through in detector order, as the model was served historically.
pub const DEFAULT_MODEL_CHANNEL_ORDER: ChannelOrder = DETECTOR_CHANNEL_ORDER;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("cannot preprocess an empty {width}x{height} crop")]
    EmptyInput { width: u32, height: u32 },
    #[error("tensor shape {actual:?} does not match [1, 3, 224, 224]")]
    Shape { actual: Vec<usize> },
}

/// A `1×3×224×224` normalised NCHW tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor(Array4<f32>);

impl NormalizedTensor {
    /// Wrap an existing array, checking its shape.
    pub fn from_array(array: Array4<f32>) -> Result<Self, PreprocessError> {
        if array.shape() != [1, 3, INPUT_SIZE, INPUT_SIZE] {
            return Err(PreprocessError::Shape {
                actual: array.shape().to_vec(),
            });
        }
        Ok(Self(array))
    }

    pub fn zeros() -> Self {
        Self(Array4::zeros((1, 3, INPUT_SIZE, INPUT_SIZE)))
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

/// Source span and normalised weights for one output sample.
#[derive(Debug, Clone)]
struct Taps {
    start: usize,
    weights: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    model_channel_order: ChannelOrder,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_CHANNEL_ORDER)
    }
}

impl Preprocessor {
    pub fn new(model_channel_order: ChannelOrder) -> Self {
        Self { model_channel_order }
    }

    pub fn model_channel_order(&self) -> ChannelOrder {
        self.model_channel_order
    }

    pub fn preprocess(&self, candidate: &FaceCandidate) -> Result<NormalizedTensor, PreprocessError> {
        self.preprocess_image(&candidate.crop)
    }

    /// Produce the model input for an arbitrary crop.
    ///
    /// Only the rows and columns that survive the centre crop are resampled,
    /// so very elongated crops cost no more than square ones.
    pub fn preprocess_image(&self, crop: &RawImage) -> Result<NormalizedTensor, PreprocessError> {
        let (in_w, in_h) = (crop.width() as usize, crop.height() as usize);
        if in_w == 0 || in_h == 0 {
            return Err(PreprocessError::EmptyInput {
                width: crop.width(),
                height: crop.height(),
            });
        }

        let (out_w, out_h) = resized_size(in_w, in_h);
        let col_taps = resample_taps(in_w, out_w, crop_offset(out_w), INPUT_SIZE);
        let row_taps = resample_taps(in_h, out_h, crop_offset(out_h), INPUT_SIZE);

        let pixels = crop.as_bytes();
        let swap = crop.channel_order() != self.model_channel_order;

        // Horizontal pass over every source row.
        let mut rows = Array3::<f32>::zeros((in_h, INPUT_SIZE, 3));
        for y in 0..in_h {
            let line = &pixels[y * in_w * 3..(y + 1) * in_w * 3];
            for (ox, taps) in col_taps.iter().enumerate() {
                let mut acc = [0.0f32; 3];
                for (k, &w) in taps.weights.iter().enumerate() {
                    let px = &line[(taps.start + k) * 3..(taps.start + k) * 3 + 3];
                    for c in 0..3 {
                        acc[c] += w * (px[c] as f32 / 255.0);
                    }
                }
                for c in 0..3 {
                    rows[[y, ox, c]] = acc[c];
                }
            }
        }

        // Vertical pass, channel reorder and normalisation.
        let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
        for (oy, taps) in row_taps.iter().enumerate() {
            for ox in 0..INPUT_SIZE {
                for c in 0..3 {
                    let mut acc = 0.0f32;
                    for (k, &w) in taps.weights.iter().enumerate() {
                        acc += w * rows[[taps.start + k, ox, c]];
                    }
                    let out_c = if swap { 2 - c } else { c };
                    tensor[[0, out_c, oy, ox]] = (acc - IMAGENET_MEAN[out_c]) / IMAGENET_STD[out_c];
                }
            }
        }

        NormalizedTensor::from_array(tensor)
    }
}

/// Output size with the shorter side at [`RESIZE_SHORT_SIDE`], aspect preserved
/// (longer side truncated).
fn resized_size(width: usize, height: usize) -> (usize, usize) {
    let short = RESIZE_SHORT_SIDE as u64;
    if width <= height {
        (RESIZE_SHORT_SIDE, (short * height as u64 / width as u64) as usize)
    } else {
        ((short * width as u64 / height as u64) as usize, RESIZE_SHORT_SIDE)
    }
}

/// Leading offset of a centred [`INPUT_SIZE`] window, rounding half to even.
fn crop_offset(size: usize) -> usize {
    let diff = size - INPUT_SIZE;
    let half = diff / 2;
    if diff % 2 == 1 && half % 2 == 1 {
        half + 1
    } else {
        half
    }
}

fn triangle(x: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 {
        1.0 - x
    } else {
        0.0
    }
}

/// Antialiased bilinear taps for outputs `first..first + count` of an
/// `in_size → out_size` resample. When downscaling the filter support widens
/// with the scale so every source pixel contributes.
fn resample_taps(in_size: usize, out_size: usize, first: usize, count: usize) -> Vec<Taps> {
    let scale = in_size as f64 / out_size as f64;
    let support_scale = scale.max(1.0);

    (first..first + count)
        .map(|o| {
            let center = (o as f64 + 0.5) * scale;
            let start = (center - support_scale + 0.5).floor().max(0.0) as usize;
            let end = ((center + support_scale + 0.5).floor() as usize).min(in_size);
            let end = end.max(start + 1).min(in_size);
            let start = start.min(end - 1);

            let raw: Vec<f64> = (start..end)
                .map(|i| triangle((i as f64 - center + 0.5) / support_scale))
                .collect();
            let total: f64 = raw.iter().sum();
            let weights = if total > 0.0 {
                raw.iter().map(|w| (w / total) as f32).collect()
            } else {
                // All taps weighted zero; fall back to the first source pixel.
                let mut w = vec![0.0f32; raw.len()];
                w[0] = 1.0;
                w
            };
            Taps { start, weights }
        })
        .collect()
}
