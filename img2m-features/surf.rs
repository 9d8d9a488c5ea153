//! Speeded-up robust features on box-filter Hessian approximations.

use crate::config::SurfParams;
use crate::error::FeatureResult;
use crate::preprocessing::{self, IntegralImage};
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::debug;
use rayon::prelude::*;
use std::f32::consts::PI;

const HAAR_SIZE0: i64 = 9;
const HAAR_SIZE_INC: i64 = 6;
/// Orientation window step in degrees
const ORI_SEARCH_INC: usize = 5;

/// Determinant-of-Hessian responses of one filter size on an octave grid
struct ResponseLayer {
    filter: i64,
    values: Vec<f32>,
}

struct OctaveGrid {
    step: i64,
    margin: i64,
    cols: usize,
    rows: usize,
    layers: Vec<ResponseLayer>,
}

impl OctaveGrid {
    #[inline]
    fn at(&self, layer: usize, col: usize, row: usize) -> f32 {
        self.layers[layer].values[row * self.cols + col]
    }

    fn position(&self, col: usize, row: usize) -> (i64, i64) {
        (self.margin + col as i64 * self.step, self.margin + row as i64 * self.step)
    }
}

pub struct SurfExtractor {
    params: SurfParams,
}

impl SurfExtractor {
    pub fn new(params: SurfParams) -> FeatureResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
        preprocessing::validate_image(img)?;
        let integral = IntegralImage::new(img);

        let mut keypoints: Vec<Keypoint> = (0..self.params.n_octaves)
            .into_par_iter()
            .filter_map(|o| self.build_octave(&integral, o))
            .flat_map_iter(|grid| self.find_maxima(&grid))
            .collect();
        debug!("SURF: {} keypoints", keypoints.len());

        if !self.params.upright {
            keypoints.par_iter_mut().for_each(|kp| kp.angle = orientation(&integral, kp));
        }
        let extended = self.params.extended;
        let rows: Vec<Vec<f32>> = keypoints.par_iter().map(|kp| descriptor(&integral, kp, extended)).collect();
        Ok((keypoints, Descriptors::from_rows(self.params.descriptor_size(), &rows)?))
    }

    fn build_octave(&self, integral: &IntegralImage, octave: usize) -> Option<OctaveGrid> {
        let n_layers = self.params.n_octave_layers + 2;
        let step = 1i64 << octave;
        let largest = (HAAR_SIZE0 + HAAR_SIZE_INC * (n_layers as i64 - 1)) << octave;
        let margin = largest / 2 + 1;
        let (w, h) = (integral.width(), integral.height());
        if w <= 2 * margin || h <= 2 * margin {
            return None;
        }
        let cols = ((w - 2 * margin) / step) as usize;
        let rows = ((h - 2 * margin) / step) as usize;
        if cols < 3 || rows < 3 {
            return None;
        }

        let layers = (0..n_layers)
            .map(|l| {
                let filter = (HAAR_SIZE0 + HAAR_SIZE_INC * l as i64) << octave;
                let values = (0..rows * cols)
                    .map(|i| {
                        let x = margin + (i % cols) as i64 * step;
                        let y = margin + (i / cols) as i64 * step;
                        hessian_det(integral, x, y, filter)
                    })
                    .collect();
                ResponseLayer { filter, values }
            })
            .collect();
        Some(OctaveGrid { step, margin, cols, rows, layers })
    }

    /// 3x3x3 maxima of the middle layers above the Hessian threshold
    fn find_maxima(&self, grid: &OctaveGrid) -> Vec<Keypoint> {
        let threshold = self.params.hessian_threshold;
        let mut found = Vec::new();
        for layer in 1..grid.layers.len() - 1 {
            for row in 1..grid.rows - 1 {
                for col in 1..grid.cols - 1 {
                    let v = grid.at(layer, col, row);
                    if v <= threshold {
                        continue;
                    }
                    let is_max = (layer - 1..=layer + 1).all(|l| {
                        (row - 1..=row + 1).all(|r| {
                            (col - 1..=col + 1).all(|c| (l == layer && r == row && c == col) || v > grid.at(l, c, r))
                        })
                    });
                    if is_max {
                        let (x, y) = grid.position(col, row);
                        let size = grid.layers[layer].filter as f32 * 1.2 / 9.0 * 2.0;
                        found.push(Keypoint::new(x as f32, y as f32, size, 0.0, v));
                    }
                }
            }
        }
        found
    }
}

/// Box-filter approximation of `det(H)` at `(x, y)` for a square filter of side `size`
fn hessian_det(integral: &IntegralImage, x: i64, y: i64, size: i64) -> f32 {
    let lobe = size / 3;
    let half = (size - 1) / 2;
    let band = lobe - 1;

    // Dyy: three stacked lobes (+1, -2, +1), width 2*lobe - 1
    let full_y = integral.box_sum(x - band, y - half, x + band + 1, y + half + 1);
    let mid_y = integral.box_sum(x - band, y - lobe / 2, x + band + 1, y + lobe / 2 + 1);
    let dyy = full_y - 3.0 * mid_y;

    let full_x = integral.box_sum(x - half, y - band, x + half + 1, y + band + 1);
    let mid_x = integral.box_sum(x - lobe / 2, y - band, x + lobe / 2 + 1, y + band + 1);
    let dxx = full_x - 3.0 * mid_x;

    let dxy = integral.box_sum(x - lobe, y - lobe, x, y) + integral.box_sum(x + 1, y + 1, x + lobe + 1, y + lobe + 1)
        - integral.box_sum(x + 1, y - lobe, x + lobe + 1, y)
        - integral.box_sum(x - lobe, y + 1, x, y + lobe + 1);

    let inv_area = 1.0 / (size * size) as f64;
    let (dxx, dyy, dxy) = (dxx * inv_area, dyy * inv_area, dxy * inv_area);
    (dxx * dyy - 0.81 * dxy * dxy) as f32
}

/// Haar wavelet responses of side `size` centred on `(x, y)`
fn haar(integral: &IntegralImage, x: i64, y: i64, size: i64) -> (f32, f32) {
    let h = (size / 2).max(1);
    let dx = integral.box_sum(x, y - h, x + h, y + h) - integral.box_sum(x - h, y - h, x, y + h);
    let dy = integral.box_sum(x - h, y, x + h, y + h) - integral.box_sum(x - h, y - h, x + h, y);
    (dx as f32, dy as f32)
}

/// Dominant direction of Haar responses in a sliding π/3 window, degrees
fn orientation(integral: &IntegralImage, kp: &Keypoint) -> f32 {
    let s = kp.size / 2.0;
    let haar_size = (4.0 * s).round() as i64;
    let mut samples = Vec::with_capacity(109);
    for i in -6i32..=6 {
        for j in -6i32..=6 {
            if i * i + j * j >= 36 {
                continue;
            }
            let x = (kp.x + i as f32 * s).round() as i64;
            let y = (kp.y + j as f32 * s).round() as i64;
            let weight = (-((i * i + j * j) as f32) / (2.0 * 2.5 * 2.5)).exp();
            let (dx, dy) = haar(integral, x, y, haar_size);
            let (dx, dy) = (dx * weight, dy * weight);
            let mut ang = dy.atan2(dx);
            if ang < 0.0 {
                ang += 2.0 * PI;
            }
            samples.push((dx, dy, ang));
        }
    }

    let mut best = 0.0f32;
    let mut angle = 0.0f32;
    for start in (0..360).step_by(ORI_SEARCH_INC) {
        let lo = (start as f32).to_radians();
        let hi = lo + PI / 3.0;
        let (mut sx, mut sy) = (0.0f32, 0.0f32);
        for &(dx, dy, ang) in &samples {
            let inside = (ang >= lo && ang < hi) || (hi > 2.0 * PI && ang < hi - 2.0 * PI);
            if inside {
                sx += dx;
                sy += dy;
            }
        }
        let val = sx * sx + sy * sy;
        if val > best {
            best = val;
            angle = sy.atan2(sx).to_degrees();
        }
    }
    if angle < 0.0 {
        angle += 360.0;
    }
    if angle >= 360.0 {
        angle -= 360.0;
    }
    angle
}

/// 4x4 subregions of 5x5 rotated Haar samples, L2 normalized
fn descriptor(integral: &IntegralImage, kp: &Keypoint, extended: bool) -> Vec<f32> {
    let s = kp.size / 2.0;
    let haar_size = (2.0 * s).round().max(2.0) as i64;
    let (sin_a, cos_a) = kp.angle.to_radians().sin_cos();
    let per_cell = if extended { 8 } else { 4 };
    let mut cells = vec![0.0f32; 16 * per_cell];

    for v in -10i32..10 {
        for u in -10i32..10 {
            let (fu, fv) = (u as f32 + 0.5, v as f32 + 0.5);
            let x = kp.x + (fu * cos_a - fv * sin_a) * s;
            let y = kp.y + (fu * sin_a + fv * cos_a) * s;
            let (dx, dy) = haar(integral, x.round() as i64, y.round() as i64, haar_size);
            let weight = (-(fu * fu + fv * fv) / (2.0 * 3.3 * 3.3)).exp();
            let rx = weight * (dx * cos_a + dy * sin_a);
            let ry = weight * (-dx * sin_a + dy * cos_a);

            let cell = (((v + 10) / 5) * 4 + (u + 10) / 5) as usize;
            let c = &mut cells[cell * per_cell..(cell + 1) * per_cell];
            if extended {
                let (a, b) = if ry >= 0.0 { (0, 1) } else { (2, 3) };
                c[a] += rx;
                c[b] += rx.abs();
                let (a, b) = if rx >= 0.0 { (4, 5) } else { (6, 7) };
                c[a] += ry;
                c[b] += ry.abs();
            } else {
                c[0] += rx;
                c[1] += ry;
                c[2] += rx.abs();
                c[3] += ry.abs();
            }
        }
    }

    let norm = cells.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in cells.iter_mut() {
            *v /= norm;
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn create_blob_image(size: u32) -> GrayImage {
        ImageBuffer::from_fn(size, size, |x, y| {
            let mut v = 40.0f32;
            for (cx, cy, r) in [(50.0, 50.0, 4.0), (120.0, 70.0, 6.0), (80.0, 140.0, 5.0), (150.0, 150.0, 3.0)] {
                let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                v += 200.0 * (-d2 / (2.0 * r * r)).exp();
            }
            Luma([v.min(255.0) as u8])
        })
    }

    #[test]
    fn test_blobs_are_detected() {
        let surf = SurfExtractor::new(SurfParams::default()).unwrap();
        let (kps, desc) = surf.detect_and_compute(&create_blob_image(200)).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.rows(), kps.len());
        assert_eq!(desc.cols(), 64);
        assert!(kps.iter().any(|kp| (kp.x - 50.0).abs() < 4.0 && (kp.y - 50.0).abs() < 4.0));
    }

    #[test]
    fn test_flat_image_has_zero_response() {
        let img = ImageBuffer::from_pixel(64, 64, Luma([90u8]));
        let integral = IntegralImage::new(&img);
        assert!(hessian_det(&integral, 32, 32, 9).abs() < 1e-6);
    }

    #[test]
    fn test_extended_upright() {
        let params = SurfParams { extended: true, upright: true, ..SurfParams::default() };
        let surf = SurfExtractor::new(params).unwrap();
        let (kps, desc) = surf.detect_and_compute(&create_blob_image(200)).unwrap();
        assert_eq!(desc.cols(), 128);
        assert!(kps.iter().all(|kp| kp.angle == 0.0));
    }
}
