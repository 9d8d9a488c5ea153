//! Binary robust invariant scalable keypoints.
//!
//! Corners are found with the 9-16 segment test on octave and intra-octave
//! layers, kept when their score beats the neighbouring layers, and described
//! with 512 short-distance brightness comparisons over a concentric sampling
//! pattern. Orientation comes from the gradients of the long-distance pairs.

use crate::config::BriskParams;
use crate::corners::{self, SegmentPattern};
use crate::error::FeatureResult;
use crate::preprocessing::{self, IntegralImage};
use image::imageops::{self, FilterType};
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::debug;
use rayon::prelude::*;
use std::f32::consts::PI;

pub const DESCRIPTOR_SIZE: usize = 64;

/// Size of a keypoint detected on the full-resolution layer
const BASIC_SIZE: f32 = 12.0;
const RING_RADII: [f32; 5] = [0.0, 2.9, 4.9, 7.4, 10.8];
const RING_POINTS: [usize; 5] = [1, 10, 14, 15, 20];
const RADIUS_FACTOR: f32 = 0.85;
const SHORT_DISTANCE: f32 = 5.85;
const LONG_DISTANCE: f32 = 8.2;

#[derive(Debug, Clone, Copy)]
struct PatternPoint {
    x: f32,
    y: f32,
    sigma: f32,
}

struct Layer {
    image: GrayImage,
    scale: f32,
}

pub struct BriskExtractor {
    params: BriskParams,
    points: Vec<PatternPoint>,
    short_pairs: Vec<(usize, usize)>,
    long_pairs: Vec<(usize, usize)>,
}

impl BriskExtractor {
    pub fn new(params: BriskParams) -> FeatureResult<Self> {
        params.validate()?;
        let points = sampling_points(params.pattern_scale);
        let (short_pairs, long_pairs) = split_pairs(&points, params.pattern_scale);
        debug!("BRISK pattern: {} points, {} short pairs, {} long pairs", points.len(), short_pairs.len(), long_pairs.len());
        Ok(Self { params, points, short_pairs, long_pairs })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<u8>)> {
        preprocessing::validate_image(img)?;
        let layers = self.build_layers(img);
        let candidates = self.detect(&layers);

        let (w, h) = (img.width() as f32, img.height() as f32);
        let extent = self.points.iter().map(|p| p.x.hypot(p.y) + p.sigma).fold(0.0f32, f32::max);
        let keypoints: Vec<Keypoint> = candidates
            .into_iter()
            .filter(|kp| {
                let r = extent * kp.size / BASIC_SIZE + 1.0;
                kp.x - r >= 0.0 && kp.y - r >= 0.0 && kp.x + r < w && kp.y + r < h
            })
            .collect();

        let integral = IntegralImage::new(img);
        let described: Vec<(Keypoint, [u8; DESCRIPTOR_SIZE])> = keypoints
            .into_par_iter()
            .map(|mut kp| {
                kp.angle = self.orientation(&integral, &kp);
                let desc = self.describe(&integral, &kp);
                (kp, desc)
            })
            .collect();
        let (keypoints, rows): (Vec<Keypoint>, Vec<[u8; DESCRIPTOR_SIZE]>) = described.into_iter().unzip();
        debug!("BRISK: {} keypoints", keypoints.len());
        Ok((keypoints, Descriptors::from_rows(DESCRIPTOR_SIZE, &rows)?))
    }

    /// Octaves c_i halve the image, intra-octaves d_i sit at 1.5 times c_i
    fn build_layers(&self, img: &GrayImage) -> Vec<Layer> {
        let mut layers = Vec::with_capacity(2 * self.params.octaves.max(1));
        let min = preprocessing::MIN_IMAGE_SIZE;
        let mut octave = img.clone();
        let mut scale = 1.0f32;
        for i in 0..self.params.octaves.max(1) {
            if i > 0 {
                let (w, h) = (octave.width() / 2, octave.height() / 2);
                if w < min || h < min {
                    break;
                }
                octave = imageops::resize(&octave, w, h, FilterType::Triangle);
                scale *= 2.0;
            }
            let intra_w = (octave.width() as f32 * 2.0 / 3.0) as u32;
            let intra_h = (octave.height() as f32 * 2.0 / 3.0) as u32;
            let intra = (intra_w >= min && intra_h >= min)
                .then(|| imageops::resize(&octave, intra_w, intra_h, FilterType::Triangle));
            layers.push(Layer { image: octave.clone(), scale });
            if let Some(image) = intra {
                layers.push(Layer { image, scale: scale * 1.5 });
            }
        }
        layers
    }

    fn detect(&self, layers: &[Layer]) -> Vec<Keypoint> {
        let thresh = self.params.thresh;
        let pattern = SegmentPattern::FAST_9_16;
        let per_layer: Vec<Vec<Keypoint>> = layers
            .par_iter()
            .enumerate()
            .map(|(i, layer)| {
                let neighbours: Vec<&Layer> = [i.checked_sub(1), Some(i + 1)]
                    .into_iter()
                    .flatten()
                    .filter_map(|j| layers.get(j))
                    .collect();
                corners::detect_corners(&layer.image, thresh, pattern, true)
                    .into_iter()
                    .filter(|c| {
                        let x = c.x as f32 * layer.scale;
                        let y = c.y as f32 * layer.scale;
                        neighbours.iter().all(|n| {
                            let nx = (x / n.scale).round() as i64;
                            let ny = (y / n.scale).round() as i64;
                            c.score >= corners::pixel_score(&n.image, nx, ny, thresh, pattern)
                        })
                    })
                    .map(|c| {
                        Keypoint::new(
                            c.x as f32 * layer.scale,
                            c.y as f32 * layer.scale,
                            BASIC_SIZE * layer.scale,
                            0.0,
                            c.score,
                        )
                    })
                    .collect()
            })
            .collect();
        per_layer.into_iter().flatten().collect()
    }

    /// Box-smoothed intensity at a pattern point scaled and rotated onto `kp`
    fn sample(&self, integral: &IntegralImage, kp: &Keypoint, point: &PatternPoint, sin_a: f32, cos_a: f32) -> f64 {
        let s = kp.size / BASIC_SIZE;
        let x = kp.x + s * (cos_a * point.x - sin_a * point.y);
        let y = kp.y + s * (sin_a * point.x + cos_a * point.y);
        let r = (point.sigma * s).max(0.5);
        let x0 = (x - r).floor() as i64;
        let y0 = (y - r).floor() as i64;
        let x1 = (x + r).ceil() as i64;
        let y1 = (y + r).ceil() as i64;
        integral.box_mean(x0, y0, x1.max(x0 + 1), y1.max(y0 + 1))
    }

    fn orientation(&self, integral: &IntegralImage, kp: &Keypoint) -> f32 {
        let values: Vec<f64> = self.points.iter().map(|p| self.sample(integral, kp, p, 0.0, 1.0)).collect();
        let (mut gx, mut gy) = (0.0f64, 0.0f64);
        for &(i, j) in &self.long_pairs {
            let (pi, pj) = (&self.points[i], &self.points[j]);
            let dx = f64::from(pj.x - pi.x);
            let dy = f64::from(pj.y - pi.y);
            let diff = (values[j] - values[i]) / (dx * dx + dy * dy);
            gx += diff * dx;
            gy += diff * dy;
        }
        if gx == 0.0 && gy == 0.0 {
            return 0.0;
        }
        let angle = (gy.atan2(gx) as f32).to_degrees();
        if angle < 0.0 { angle + 360.0 } else { angle }
    }

    fn describe(&self, integral: &IntegralImage, kp: &Keypoint) -> [u8; DESCRIPTOR_SIZE] {
        let (sin_a, cos_a) = kp.angle.to_radians().sin_cos();
        let values: Vec<f64> = self.points.iter().map(|p| self.sample(integral, kp, p, sin_a, cos_a)).collect();
        let mut d = [0u8; DESCRIPTOR_SIZE];
        for (bit, &(i, j)) in self.short_pairs.iter().enumerate() {
            if values[i] > values[j] {
                d[bit / 8] |= 1 << (bit % 8);
            }
        }
        d
    }
}

/// Concentric rings, odd rings rotated by half a step
fn sampling_points(pattern_scale: f32) -> Vec<PatternPoint> {
    let f = RADIUS_FACTOR * pattern_scale;
    let mut points = Vec::with_capacity(RING_POINTS.iter().sum());
    for (ring, (&radius, &count)) in RING_RADII.iter().zip(RING_POINTS.iter()).enumerate() {
        let r = radius * f;
        let sigma = if count == 1 {
            0.5 * RING_RADII[1] * f * PI / RING_POINTS[1] as f32
        } else {
            0.5 * r * PI / count as f32
        };
        let offset = if ring % 2 == 1 { PI / count as f32 } else { 0.0 };
        for k in 0..count {
            let theta = 2.0 * PI * k as f32 / count as f32 + offset;
            points.push(PatternPoint { x: r * theta.cos(), y: r * theta.sin(), sigma });
        }
    }
    points
}

/// Short pairs (first 512) drive the bits, long pairs the orientation
fn split_pairs(points: &[PatternPoint], pattern_scale: f32) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let d_short = SHORT_DISTANCE * pattern_scale;
    let d_long = LONG_DISTANCE * pattern_scale;
    let mut short = Vec::new();
    let mut long = Vec::new();
    for i in 1..points.len() {
        for j in 0..i {
            let d = (points[i].x - points[j].x).hypot(points[i].y - points[j].y);
            if d < d_short && short.len() < DESCRIPTOR_SIZE * 8 {
                short.push((i, j));
            } else if d > d_long {
                long.push((i, j));
            }
        }
    }
    (short, long)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn create_test_image() -> GrayImage {
        ImageBuffer::from_fn(192, 192, |x, y| {
            let inside = (12..36).contains(&(x % 48)) && (12..36).contains(&(y % 48));
            Luma([if inside { 210u8 } else { 35 }])
        })
    }

    #[test]
    fn test_pattern_layout() {
        let points = sampling_points(1.0);
        assert_eq!(points.len(), 60);
        let (short, long) = split_pairs(&points, 1.0);
        assert!(!short.is_empty() && short.len() <= 512);
        assert!(!long.is_empty());
    }

    #[test]
    fn test_detect_and_compute() {
        let brisk = BriskExtractor::new(BriskParams::default()).unwrap();
        let img = create_test_image();
        let (kps, desc) = brisk.detect_and_compute(&img).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.rows(), kps.len());
        assert_eq!(desc.cols(), DESCRIPTOR_SIZE);
        assert!(kps.iter().all(|kp| kp.x >= 0.0 && kp.x < 192.0 && kp.size >= BASIC_SIZE));
    }

    #[test]
    fn test_layers_scale() {
        let brisk = BriskExtractor::new(BriskParams::default()).unwrap();
        let layers = brisk.build_layers(&create_test_image());
        assert_eq!(layers[0].scale, 1.0);
        assert_eq!(layers[1].scale, 1.5);
        assert_eq!(layers[2].scale, 2.0);
        assert_eq!(layers[2].image.width(), 96);
    }

    #[test]
    fn test_uniform_image() {
        let brisk = BriskExtractor::new(BriskParams::default()).unwrap();
        let img = ImageBuffer::from_pixel(64, 64, Luma([100u8]));
        let (kps, desc) = brisk.detect_and_compute(&img).unwrap();
        assert!(kps.is_empty());
        assert_eq!(desc.rows(), 0);
    }
}
