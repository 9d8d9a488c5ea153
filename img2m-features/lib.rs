//! Descriptor kernels for the image-to-matches stage.
//!
//! Every detector family is selected through [`DetectorConfig`] and run by a
//! [`FeatureExtractor`], which returns keypoints in the coordinates of the
//! input image and descriptors in the canonical element type of the family
//! (`f32` for SIFT, SURF, KAZE and SuperPoint; `u8` for the binary ones).

pub mod akaze;
pub mod brisk;
pub mod config;
pub mod corners;
pub mod error;
pub mod extractor;
pub mod fast;
pub mod kaze;
pub mod nonlinear;
pub mod orb;
pub mod preprocessing;
pub mod rootsift;
pub mod sift;
pub mod superpoint;
pub mod surf;

pub use config::{
    AgastParams, AgastType, AkazeParams, BriskParams, DetectorConfig, FastParams, KazeParams, OrbParams,
    OrbScoreType, SiftParams, SiftPreset, SuperPointParams, SurfParams,
};
pub use error::{FeatureError, FeatureResult};
pub use extractor::FeatureExtractor;

use image::GrayImage;
use img2m_core::{DescriptorMatrix, Keypoint};

/// One-shot extraction with a freshly built kernel
pub fn extract(config: &DetectorConfig, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, DescriptorMatrix)> {
    FeatureExtractor::new(config.clone())?.extract(img)
}

/// One-shot descriptor computation on existing keypoints
pub fn compute(config: &DetectorConfig, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<DescriptorMatrix> {
    FeatureExtractor::new(config.clone())?.compute(img, keypoints)
}
