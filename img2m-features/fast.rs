use crate::config::{AgastParams, FastParams, OrbParams};
use crate::corners::{self, SegmentPattern};
use crate::error::FeatureResult;
use crate::orb::OrbExtractor;
use crate::preprocessing;
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};

/// Diameter reported for segment-test keypoints
const KEYPOINT_SIZE: f32 = 7.0;

/// Segment-test detection described with ORB on the detected keypoints
fn detect_and_describe(
    img: &GrayImage,
    threshold: u8,
    pattern: SegmentPattern,
    nonmax: bool,
    orb: &OrbExtractor,
) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
    preprocessing::validate_image(img)?;
    let radius = (orb.params().patch_size / 2) as i32;
    let keypoints: Vec<Keypoint> = corners::detect_corners(img, threshold, pattern, nonmax)
        .into_iter()
        .map(|c| {
            let angle = corners::intensity_centroid_angle(img, c.x as f32, c.y as f32, radius);
            Keypoint::new(c.x as f32, c.y as f32, KEYPOINT_SIZE, angle, c.score)
        })
        .collect();
    let descriptors = orb.compute(img, &keypoints)?;
    Ok((keypoints, descriptors))
}

pub struct FastExtractor {
    params: FastParams,
    orb: OrbExtractor,
}

impl FastExtractor {
    pub fn new(params: FastParams) -> FeatureResult<Self> {
        Ok(Self { params, orb: OrbExtractor::new(OrbParams::default())? })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
        detect_and_describe(img, self.params.threshold, SegmentPattern::FAST_9_16, self.params.nonmax_suppression, &self.orb)
    }

    pub fn compute(&self, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<Descriptors<u8>> {
        self.orb.compute(img, keypoints)
    }
}

pub struct AgastExtractor {
    params: AgastParams,
    orb: OrbExtractor,
}

impl AgastExtractor {
    pub fn new(params: AgastParams) -> FeatureResult<Self> {
        Ok(Self { params, orb: OrbExtractor::new(OrbParams::default())? })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
        let pattern = SegmentPattern::for_agast(self.params.agast_type);
        detect_and_describe(img, self.params.threshold, pattern, self.params.nonmax_suppression, &self.orb)
    }

    pub fn compute(&self, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<Descriptors<u8>> {
        self.orb.compute(img, keypoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgastType;
    use image::{ImageBuffer, Luma};

    fn create_grid_image() -> GrayImage {
        ImageBuffer::from_fn(96, 96, |x, y| {
            let inside = (8..24).contains(&(x % 32)) && (8..24).contains(&(y % 32));
            Luma([if inside { 220u8 } else { 30 }])
        })
    }

    #[test]
    fn test_fast_keypoints_have_descriptors() {
        let fast = FastExtractor::new(FastParams::default()).unwrap();
        let (kps, desc) = fast.detect_and_compute(&create_grid_image()).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.rows(), kps.len());
        assert_eq!(desc.cols(), 32);
        assert!(kps.iter().all(|kp| kp.size == KEYPOINT_SIZE));
    }

    #[test]
    fn test_agast_recompute_is_stable() {
        let params = AgastParams { agast_type: AgastType::Agast7_12d, ..AgastParams::default() };
        let agast = AgastExtractor::new(params).unwrap();
        let img = create_grid_image();
        let (kps, desc) = agast.detect_and_compute(&img).unwrap();
        assert_eq!(agast.compute(&img, &kps).unwrap(), desc);
    }
}
