//! Oriented FAST and rotated BRIEF.

use crate::config::{OrbParams, OrbScoreType};
use crate::corners::{self, ScoredCorner, SegmentPattern};
use crate::error::{FeatureError, FeatureResult};
use crate::preprocessing::{self, GrayF32};
use image::imageops::{self, FilterType};
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::debug;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use rayon::prelude::*;

pub const DESCRIPTOR_SIZE: usize = 32;

/// Seed of the test-pair sampling pattern
const PATTERN_SEED: u64 = 0x0B_2011;
const HARRIS_BLOCK: u32 = 7;
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;

/// One pyramid level with the blurred copy used for descriptors
struct Level {
    image: GrayImage,
    smoothed: GrayF32,
    scale: f32,
}

pub struct OrbExtractor {
    params: OrbParams,
    /// 256 point pairs of the binary test, relative to the keypoint
    pattern: Vec<[(f32, f32); 2]>,
}

impl OrbExtractor {
    pub fn new(params: OrbParams) -> FeatureResult<Self> {
        params.validate()?;
        let pattern = sampling_pattern(params.patch_size)?;
        Ok(Self { params, pattern })
    }

    pub fn params(&self) -> &OrbParams {
        &self.params
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
        preprocessing::validate_image(img)?;
        let levels = self.build_pyramid(img);
        let budgets = self.features_per_level();

        let per_level: Vec<Vec<(Keypoint, [u8; DESCRIPTOR_SIZE])>> = levels
            .par_iter()
            .zip(budgets.par_iter())
            .map(|(level, &budget)| self.detect_level(level, budget))
            .collect();

        let (keypoints, rows): (Vec<Keypoint>, Vec<[u8; DESCRIPTOR_SIZE]>) = per_level.into_iter().flatten().unzip();
        debug!("ORB: {} keypoints over {} levels", keypoints.len(), levels.len());
        Ok((keypoints, Descriptors::from_rows(DESCRIPTOR_SIZE, &rows)?))
    }

    /// Describe existing keypoints, picking the pyramid level from the keypoint size
    pub fn compute(&self, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<Descriptors<u8>> {
        preprocessing::validate_image(img)?;
        let levels = self.build_pyramid(img);
        let log_factor = self.params.scale_factor.ln();
        let rows: Vec<[u8; DESCRIPTOR_SIZE]> = keypoints
            .par_iter()
            .map(|kp| {
                let rel = (kp.size.max(1e-3) / self.params.patch_size as f32).ln() / log_factor;
                let index = (rel.round() + self.params.first_level as f32).clamp(0.0, (levels.len() - 1) as f32) as usize;
                let level = &levels[index];
                self.describe(&level.smoothed, kp.x / level.scale, kp.y / level.scale, kp.angle)
            })
            .collect();
        Ok(Descriptors::from_rows(DESCRIPTOR_SIZE, &rows)?)
    }

    fn build_pyramid(&self, img: &GrayImage) -> Vec<Level> {
        let p = &self.params;
        (0..p.nlevels)
            .filter_map(|l| {
                let scale = p.scale_factor.powi(l as i32 - p.first_level as i32);
                let w = (img.width() as f32 / scale).round() as u32;
                let h = (img.height() as f32 / scale).round() as u32;
                if w < preprocessing::MIN_IMAGE_SIZE || h < preprocessing::MIN_IMAGE_SIZE {
                    return None;
                }
                let image = if (scale - 1.0).abs() < f32::EPSILON {
                    img.clone()
                } else {
                    imageops::resize(img, w, h, FilterType::Triangle)
                };
                let smoothed = preprocessing::blur(&preprocessing::to_unit_float(&image), DESCRIPTOR_BLUR_SIGMA);
                Some(Level { image, smoothed, scale })
            })
            .collect()
    }

    /// Geometric split of `nfeatures` over the levels, remainder on the coarsest
    fn features_per_level(&self) -> Vec<usize> {
        let p = &self.params;
        let factor = 1.0 / p.scale_factor;
        let mut desired = p.nfeatures as f32 * (1.0 - factor) / (1.0 - factor.powi(p.nlevels as i32));
        let mut budgets = Vec::with_capacity(p.nlevels);
        let mut sum = 0usize;
        for _ in 0..p.nlevels.saturating_sub(1) {
            let n = desired.round() as usize;
            budgets.push(n);
            sum += n;
            desired *= factor;
        }
        budgets.push(p.nfeatures.saturating_sub(sum));
        budgets
    }

    fn detect_level(&self, level: &Level, budget: usize) -> Vec<(Keypoint, [u8; DESCRIPTOR_SIZE])> {
        if budget == 0 {
            return Vec::new();
        }
        let p = &self.params;
        let (w, h) = level.image.dimensions();
        let border = p.edge_threshold.max(p.patch_size / 2 + 1) as u32;
        let mut corners: Vec<ScoredCorner> =
            corners::detect_corners(&level.image, p.fast_threshold, SegmentPattern::FAST_9_16, true)
                .into_iter()
                .filter(|c| c.x >= border && c.y >= border && c.x + border < w && c.y + border < h)
                .collect();

        corners.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x)));
        if p.score_type == OrbScoreType::Harris {
            corners.truncate(2 * budget);
            for c in corners.iter_mut() {
                c.score = corners::harris_response(&level.image, c.x, c.y, HARRIS_BLOCK);
            }
            corners.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x)));
        }
        corners.truncate(budget);

        let radius = (p.patch_size / 2) as i32;
        corners
            .iter()
            .map(|c| {
                let angle = corners::intensity_centroid_angle(&level.image, c.x as f32, c.y as f32, radius);
                let desc = self.describe(&level.smoothed, c.x as f32, c.y as f32, angle);
                let kp = Keypoint::new(
                    c.x as f32 * level.scale,
                    c.y as f32 * level.scale,
                    p.patch_size as f32 * level.scale,
                    angle,
                    c.score,
                );
                (kp, desc)
            })
            .collect()
    }

    /// Steered BRIEF: rotate the pair pattern by `angle` and compare samples
    fn describe(&self, smoothed: &GrayF32, x: f32, y: f32, angle: f32) -> [u8; DESCRIPTOR_SIZE] {
        let (s, c) = angle.to_radians().sin_cos();
        let mut d = [0u8; DESCRIPTOR_SIZE];
        for (i, pair) in self.pattern.iter().enumerate() {
            let [(x1, y1), (x2, y2)] = *pair;
            let v1 = preprocessing::bilinear(smoothed, x + c * x1 - s * y1, y + s * x1 + c * y1);
            let v2 = preprocessing::bilinear(smoothed, x + c * x2 - s * y2, y + s * x2 + c * y2);
            if v1 < v2 {
                d[i / 8] |= 1 << (i % 8);
            }
        }
        d
    }
}

/// Isotropic Gaussian test pairs inside the patch
fn sampling_pattern(patch_size: usize) -> FeatureResult<Vec<[(f32, f32); 2]>> {
    let half = (patch_size / 2) as f32 - 2.0;
    let normal = Normal::new(0.0f32, patch_size as f32 / 5.0).map_err(|e| FeatureError::InvalidParameter {
        detector: "ORB",
        name: "patch_size",
        reason: e.to_string(),
    })?;
    let mut rng = Pcg64::seed_from_u64(PATTERN_SEED);
    let mut sample = || normal.sample(&mut rng).round().clamp(-half, half);
    Ok((0..DESCRIPTOR_SIZE * 8)
        .map(|_| [(sample(), sample()), (sample(), sample())])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn create_test_image(size: u32) -> GrayImage {
        ImageBuffer::from_fn(size, size, |x, y| {
            let inside = (10..26).contains(&(x % 36)) && (8..22).contains(&(y % 30));
            let shade = ((x / 36 + 2 * (y / 30)) % 3) as u8;
            Luma([if inside { 180 + 25 * shade } else { 25 }])
        })
    }

    #[test]
    fn test_features_per_level_sum() {
        let orb = OrbExtractor::new(OrbParams::default()).unwrap();
        let budgets = orb.features_per_level();
        assert_eq!(budgets.len(), 8);
        assert_eq!(budgets.iter().sum::<usize>(), 1000);
        assert!(budgets[0] > budgets[7]);
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let a = sampling_pattern(31).unwrap();
        let b = sampling_pattern(31).unwrap();
        assert_eq!(a.len(), 256);
        assert_eq!(a, b);
        assert!(a.iter().flatten().all(|&(x, y)| x.abs() <= 13.0 && y.abs() <= 13.0));
    }

    #[test]
    fn test_detect_and_compute() {
        let orb = OrbExtractor::new(OrbParams { nfeatures: 200, ..OrbParams::default() }).unwrap();
        let img = create_test_image(200);
        let (kps, desc) = orb.detect_and_compute(&img).unwrap();
        assert!(!kps.is_empty());
        assert!(kps.len() <= 200);
        assert_eq!(desc.rows(), kps.len());
        assert_eq!(desc.cols(), DESCRIPTOR_SIZE);
    }

    #[test]
    fn test_compute_matches_detection_on_base_level() {
        let orb = OrbExtractor::new(OrbParams::default()).unwrap();
        let img = create_test_image(200);
        let (kps, desc) = orb.detect_and_compute(&img).unwrap();
        let base: Vec<usize> = kps
            .iter()
            .enumerate()
            .filter(|(_, kp)| kp.size == 31.0)
            .map(|(i, _)| i)
            .collect();
        let subset: Vec<Keypoint> = base.iter().map(|&i| kps[i]).collect();
        let recomputed = orb.compute(&img, &subset).unwrap();
        assert_eq!(recomputed, desc.select_rows(&base));
    }
}
