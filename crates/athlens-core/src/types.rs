use image::GrayImage;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Number of output units of the classifier's final layer.
pub const CLASS_COUNT: usize = 5;

/// The athletes the classifier was trained on, in output-unit order.
///
/// The discriminant is the index into the model's logits. Reordering the
/// variants requires re-exporting the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassLabel {
    CristianoRonaldo,
    ErlingHaaland,
    KylianMbappe,
    LionelMessi,
    NeymarJr,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; CLASS_COUNT] = [
        ClassLabel::CristianoRonaldo,
        ClassLabel::ErlingHaaland,
        ClassLabel::KylianMbappe,
        ClassLabel::LionelMessi,
        ClassLabel::NeymarJr,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Display name, as reported to callers.
    pub fn name(self) -> &'static str {
        match self {
            ClassLabel::CristianoRonaldo => "Cristiano Ronaldo",
            ClassLabel::ErlingHaaland => "Erling Haaland",
            ClassLabel::KylianMbappe => "Kylian Mbappe",
            ClassLabel::LionelMessi => "Lionel Messi",
            ClassLabel::NeymarJr => "Neymar Jr",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ClassLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Interleaved channel order of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl std::str::FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(ChannelOrder::Rgb),
            "bgr" => Ok(ChannelOrder::Bgr),
            other => Err(format!("unknown channel order '{other}' (expected rgb or bgr)")),
        }
    }
}

/// Channel order the Haar cascades were calibrated against. Every [`RawImage`]
/// holds its pixels in this order.
pub const DETECTOR_CHANNEL_ORDER: ChannelOrder = ChannelOrder::Bgr;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("pixel buffer length {actual} does not match {width}x{height}x3 = {expected}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A decoded 3-channel image in [`DETECTOR_CHANNEL_ORDER`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    width: u32,
    height: u32,
    /// Interleaved pixels, `width * height * 3` bytes.
    data: Vec<u8>,
}

impl RawImage {
    /// Decode an encoded image (JPEG, PNG, ...) into detector channel order.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_pixels(width, height, rgb.into_raw(), ChannelOrder::Rgb)
    }

    /// Build an image from an interleaved buffer in the given channel order,
    /// converting to [`DETECTOR_CHANNEL_ORDER`] if needed.
    pub fn from_pixels(
        width: u32,
        height: u32,
        mut data: Vec<u8>,
        order: ChannelOrder,
    ) -> Result<Self, DecodeError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(DecodeError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        if order != DETECTOR_CHANNEL_ORDER {
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channel_order(&self) -> ChannelOrder {
        DETECTOR_CHANNEL_ORDER
    }

    /// Interleaved pixel bytes in [`DETECTOR_CHANNEL_ORDER`].
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pixel at (x, y) as `[b, g, r]`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Copy out a sub-image. The region is clamped to the image bounds.
    pub fn crop(&self, region: &Region) -> RawImage {
        let region = region.clamp_to(self.width, self.height);
        let row_bytes = region.width as usize * 3;
        let mut data = Vec::with_capacity(row_bytes * region.height as usize);
        for y in region.y..region.y + region.height {
            let start = (y as usize * self.width as usize + region.x as usize) * 3;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        RawImage {
            width: region.width,
            height: region.height,
            data,
        }
    }

    /// Luma conversion with the fixed-point BT.601 weights the cascades
    /// were trained on (R 0.299, G 0.587, B 0.114).
    pub fn to_gray(&self) -> GrayImage {
        const B_W: u32 = 1868;
        const G_W: u32 = 9617;
        const R_W: u32 = 4899;
        const SHIFT: u32 = 14;

        let luma = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((b * B_W + g * G_W + r * R_W + (1 << (SHIFT - 1))) >> SHIFT) as u8
            })
            .collect();
        // Length is width * height by construction.
        GrayImage::from_raw(self.width, self.height, luma)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with the `[0, width) x [0, height)` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Region {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Region {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// The face region selected for classification.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    /// Face rectangle in full-image coordinates.
    pub region: Region,
    /// Eye detections that qualified the face, relative to `region`.
    pub eyes: Vec<Region>,
    /// Cropped pixels of `region`.
    pub crop: RawImage,
}

/// Per-class probabilities in [`ClassLabel`] order, rounded to 3 decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distribution {
    values: [f64; CLASS_COUNT],
}

impl Distribution {
    /// Round raw probabilities for reporting.
    pub fn from_probabilities(probabilities: &[f32; CLASS_COUNT]) -> Self {
        let mut values = [0.0f64; CLASS_COUNT];
        for (v, &p) in values.iter_mut().zip(probabilities.iter()) {
            *v = (p as f64 * 1000.0).round() / 1000.0;
        }
        Self { values }
    }

    pub fn get(&self, label: ClassLabel) -> f64 {
        self.values[label.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, f64)> + '_ {
        ClassLabel::ALL.iter().map(|&l| (l, self.values[l.index()]))
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }
}

impl Serialize for Distribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CLASS_COUNT))?;
        for (label, p) in self.iter() {
            map.serialize_entry(label.name(), &p)?;
        }
        map.end()
    }
}

/// Classification of one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub label: ClassLabel,
    #[serde(rename = "probabilities")]
    pub distribution: Distribution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_matches_index() {
        for (i, label) in ClassLabel::ALL.iter().enumerate() {
            assert_eq!(label.index(), i);
            assert_eq!(ClassLabel::from_index(i), Some(*label));
        }
        assert_eq!(ClassLabel::from_index(CLASS_COUNT), None);
        assert_eq!(ClassLabel::ALL[0].name(), "Cristiano Ronaldo");
        assert_eq!(ClassLabel::ALL[4].name(), "Neymar Jr");
    }

    #[test]
    fn test_from_rgb_pixels_swaps_to_bgr() {
        let img = RawImage::from_pixels(1, 1, vec![10, 20, 30], ChannelOrder::Rgb).unwrap();
        assert_eq!(img.pixel(0, 0), [30, 20, 10]);
        assert_eq!(img.channel_order(), ChannelOrder::Bgr);

        let img = RawImage::from_pixels(1, 1, vec![10, 20, 30], ChannelOrder::Bgr).unwrap();
        assert_eq!(img.pixel(0, 0), [10, 20, 30]);
    }

    #[test]
    fn test_from_pixels_rejects_bad_length() {
        let err = RawImage::from_pixels(2, 2, vec![0; 11], ChannelOrder::Bgr).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLength { expected: 12, actual: 11, .. }));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(RawImage::decode(b"definitely not an image").is_err());
    }

    #[test]
    fn test_decode_png_is_bgr() {
        let mut rgb = image::RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        rgb.put_pixel(1, 0, image::Rgb([0, 0, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let img = RawImage::decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (2, 1));
        assert_eq!(img.pixel(0, 0), [0, 0, 255]);
        assert_eq!(img.pixel(1, 0), [255, 0, 0]);
    }

    #[test]
    fn test_gray_weights() {
        let img = RawImage::from_pixels(
            3,
            1,
            vec![255, 255, 255, 0, 0, 0, 0, 0, 255],
            ChannelOrder::Bgr,
        )
        .unwrap();
        let gray = img.to_gray();
        assert_eq!(gray.get_pixel(0, 0).0[0], 255);
        assert_eq!(gray.get_pixel(1, 0).0[0], 0);
        // Pure red: 0.299 * 255 = 76.2
        assert_eq!(gray.get_pixel(2, 0).0[0], 76);
    }

    #[test]
    fn test_crop_and_clamp() {
        let data: Vec<u8> = (0..4 * 3 * 3).map(|v| v as u8).collect();
        let img = RawImage::from_pixels(4, 3, data, ChannelOrder::Bgr).unwrap();
        let crop = img.crop(&Region::new(1, 1, 2, 2));
        assert_eq!((crop.width(), crop.height()), (2, 2));
        assert_eq!(crop.pixel(0, 0), img.pixel(1, 1));
        assert_eq!(crop.pixel(1, 1), img.pixel(2, 2));

        let clamped = img.crop(&Region::new(3, 2, 10, 10));
        assert_eq!((clamped.width(), clamped.height()), (1, 1));
    }

    #[test]
    fn test_distribution_rounding_and_serialization() {
        let dist = Distribution::from_probabilities(&[0.12345, 0.5, 0.0004, 0.2, 0.17615]);
        assert!((dist.get(ClassLabel::CristianoRonaldo) - 0.123).abs() < 1e-9);
        assert_eq!(dist.get(ClassLabel::KylianMbappe), 0.0);

        let json = serde_json::to_string(&dist).unwrap();
        let first = json.find("Cristiano Ronaldo").unwrap();
        let last = json.find("Neymar Jr").unwrap();
        assert!(first < last);
    }

    #[test]
    fn test_channel_order_parse() {
        assert_eq!("BGR".parse::<ChannelOrder>(), Ok(ChannelOrder::Bgr));
        assert_eq!("rgb".parse::<ChannelOrder>(), Ok(ChannelOrder::Rgb));
        assert!("yuv".parse::<ChannelOrder>().is_err());
    }
}
