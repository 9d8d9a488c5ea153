//! AKAZE keypoints with the rotation invariant MLDB descriptor, computed by
//! the `akaze` crate.

use crate::config::AkazeParams;
use crate::error::{FeatureError, FeatureResult};
use crate::preprocessing;
use akaze::Akaze;
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::debug;

/// Bits produced per channel by the 2x2, 3x3 and 4x4 grids
const BITS_PER_CHANNEL: usize = 6 + 36 + 120;

/// Descriptor length in bytes for a channel count
pub fn descriptor_size(channels: usize) -> usize {
    (BITS_PER_CHANNEL * channels).div_ceil(8)
}

pub struct AkazeExtractor {
    params: AkazeParams,
    akaze: Akaze,
}

impl AkazeExtractor {
    pub fn new(params: AkazeParams) -> FeatureResult<Self> {
        params.validate()?;
        let akaze = Akaze {
            detector_threshold: f64::from(params.threshold),
            max_octave_evolution: params.n_octaves as u32,
            num_sublevels: params.n_octave_layers as u32,
            descriptor_channels: params.descriptor_channels,
            ..Akaze::default()
        };
        Ok(Self { params, akaze })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
        preprocessing::validate_image(img)?;
        let (width, height) = img.dimensions();
        let gray = image_akaze::GrayImage::from_raw(width, height, img.as_raw().clone())
            .ok_or(FeatureError::InvalidImageSize { width, height })?;
        let (points, bits) = self.akaze.extract(&image_akaze::DynamicImage::ImageLuma8(gray));

        // The crate fills a fixed 64-byte array; only the MLDB prefix carries bits
        let cols = descriptor_size(self.params.descriptor_channels);
        let mut descriptors = Descriptors::new(cols);
        for row in &bits {
            descriptors.push_row(&row.bytes()[..cols])?;
        }
        let keypoints: Vec<Keypoint> = points.iter().map(to_keypoint).collect();
        debug!("AKAZE: {} keypoints, {} byte descriptors", keypoints.len(), cols);
        Ok((keypoints, descriptors))
    }
}

fn to_keypoint(kp: &akaze::KeyPoint) -> Keypoint {
    let (x, y) = kp.point;
    Keypoint::new(x, y, kp.size, kp.angle.to_degrees().rem_euclid(360.0), kp.response)
}
