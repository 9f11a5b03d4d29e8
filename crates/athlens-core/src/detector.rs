//! Face candidate selection: frontal-face regions gated by an eye count.

use crate::cascade::{CascadeError, HaarCascade, ScanParams};
use crate::types::{FaceCandidate, RawImage, Region};
use image::GrayImage;

/// Minimum eye detections for a face region to be usable.
pub const MIN_EYES: usize = 2;

/// A geometric detector mapping a grayscale image to candidate regions.
///
/// Regions are in the coordinates of the image passed in, in the detector's
/// own scan order.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage) -> Vec<Region>;
}

/// Finds the first face region that contains at least [`MIN_EYES`] eyes.
pub struct FaceCandidateDetector {
    faces: Box<dyn RegionDetector>,
    eyes: Box<dyn RegionDetector>,
}

impl FaceCandidateDetector {
    pub fn new(faces: Box<dyn RegionDetector>, eyes: Box<dyn RegionDetector>) -> Self {
        Self { faces, eyes }
    }

    /// Load the frontal-face and eye cascades, sharing one set of scan parameters.
    pub fn load(face_cascade: &str, eye_cascade: &str, params: ScanParams) -> Result<Self, CascadeError> {
        let faces = HaarCascade::load(face_cascade)?.with_params(params)?;
        let eyes = HaarCascade::load(eye_cascade)?.with_params(params)?;
        Ok(Self::new(Box::new(faces), Box::new(eyes)))
    }

    /// Return the first face, in the face detector's scan order, whose crop
    /// yields at least [`MIN_EYES`] eye detections.
    ///
    /// Later faces are not inspected once one qualifies, even if they are
    /// larger. Duplicate face detections are not merged.
    pub fn find_face_candidate(&self, image: &RawImage) -> Option<FaceCandidate> {
        let gray = image.to_gray();
        let faces = self.faces.detect(&gray);
        tracing::debug!(faces = faces.len(), "face regions detected");

        for (i, face) in faces.iter().enumerate() {
            let face = face.clamp_to(gray.width(), gray.height());
            if face.width == 0 || face.height == 0 {
                continue;
            }
            let roi = image::imageops::crop_imm(&gray, face.x, face.y, face.width, face.height).to_image();
            let eyes = self.eyes.detect(&roi);
            tracing::debug!(face = i, region = ?face, eyes = eyes.len(), "eye scan");

            if eyes.len() >= MIN_EYES {
                return Some(FaceCandidate {
                    region: face,
                    eyes,
                    crop: image.crop(&face),
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelOrder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedFaces(Vec<Region>);

    impl RegionDetector for FixedFaces {
        fn detect(&self, _gray: &GrayImage) -> Vec<Region> {
            self.0.clone()
        }
    }

    /// Reports one eye per pixel brighter than 200 in the crop.
    struct BrightPixelEyes {
        calls: Arc<AtomicUsize>,
    }

    impl RegionDetector for BrightPixelEyes {
        fn detect(&self, gray: &GrayImage) -> Vec<Region> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            gray.enumerate_pixels()
                .filter(|(_, _, p)| p.0[0] > 200)
                .map(|(x, y, _)| Region::new(x, y, 1, 1))
                .collect()
        }
    }

    fn image_with_bright(width: u32, height: u32, bright: &[(u32, u32)]) -> RawImage {
        let mut data = vec![0u8; (width * height * 3) as usize];
        for &(x, y) in bright {
            let i = ((y * width + x) * 3) as usize;
            data[i..i + 3].copy_from_slice(&[255, 255, 255]);
        }
        RawImage::from_pixels(width, height, data, ChannelOrder::Bgr).unwrap()
    }

    fn detector(faces: Vec<Region>) -> (FaceCandidateDetector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let det = FaceCandidateDetector::new(
            Box::new(FixedFaces(faces)),
            Box::new(BrightPixelEyes { calls: Arc::clone(&calls) }),
        );
        (det, calls)
    }

    #[test]
    fn test_no_faces() {
        let (det, calls) = detector(vec![]);
        let img = image_with_bright(20, 20, &[(1, 1), (2, 2)]);
        assert!(det.find_face_candidate(&img).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_faces_with_one_eye_rejected() {
        let (det, calls) = detector(vec![Region::new(0, 0, 10, 10), Region::new(10, 10, 10, 10)]);
        let img = image_with_bright(20, 20, &[(1, 1), (15, 15)]);
        assert!(det.find_face_candidate(&img).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_second_face_selected_when_first_lacks_eyes() {
        let (det, _) = detector(vec![Region::new(0, 0, 10, 10), Region::new(10, 10, 10, 10)]);
        let img = image_with_bright(20, 20, &[(1, 1), (12, 13), (16, 13)]);

        let candidate = det.find_face_candidate(&img).unwrap();
        assert_eq!(candidate.region, Region::new(10, 10, 10, 10));
        assert_eq!(candidate.eyes, vec![Region::new(2, 3, 1, 1), Region::new(6, 3, 1, 1)]);
        assert_eq!((candidate.crop.width(), candidate.crop.height()), (10, 10));
        assert_eq!(candidate.crop.pixel(2, 3), [255, 255, 255]);
    }

    #[test]
    fn test_first_qualifying_face_wins() {
        // The later region is larger and also qualifies, but is never scanned.
        let (det, calls) = detector(vec![Region::new(0, 0, 10, 10), Region::new(0, 0, 20, 20)]);
        let img = image_with_bright(20, 20, &[(1, 1), (5, 5), (15, 15)]);

        let candidate = det.find_face_candidate(&img).unwrap();
        assert_eq!(candidate.region, Region::new(0, 0, 10, 10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_out_of_bounds_face_clamped() {
        let (det, _) = detector(vec![Region::new(15, 15, 10, 10)]);
        let img = image_with_bright(20, 20, &[(16, 16), (18, 18)]);
        let candidate = det.find_face_candidate(&img).unwrap();
        assert_eq!(candidate.region, Region::new(15, 15, 5, 5));
    }

    #[test]
    fn test_load_missing_cascade() {
        let result = FaceCandidateDetector::load(
            "/nonexistent/face.xml",
            "/nonexistent/eye.xml",
            ScanParams::default(),
        );
        assert!(matches!(result, Err(CascadeError::NotFound(_))));
    }
}
