use crate::config::KazeParams;
use crate::error::FeatureResult;
use crate::nonlinear::{Evolution, NonlinearKeypoint, NonlinearOptions, NonlinearScaleSpace};
use crate::preprocessing;
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use rayon::prelude::*;

/// KAZE detector with the M-SURF float descriptor
pub struct KazeExtractor {
    params: KazeParams,
}

impl KazeExtractor {
    pub fn new(params: KazeParams) -> FeatureResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
        preprocessing::validate_image(img)?;
        let options = NonlinearOptions::new(self.params.threshold, self.params.n_octaves, self.params.n_octave_layers);
        let mut space = NonlinearScaleSpace::build(img, options);
        let candidates = space.detect(self.params.upright);

        let extended = self.params.extended;
        let rows: Vec<Vec<f32>> = candidates
            .par_iter()
            .map(|kp| msurf_descriptor(kp, &space.evolutions[kp.level], extended))
            .collect();

        let keypoints = candidates.iter().map(NonlinearKeypoint::to_keypoint).collect();
        Ok((keypoints, Descriptors::from_rows(self.params.descriptor_size(), &rows)?))
    }
}

#[inline]
fn gaussian(x: f32, y: f32, sigma: f32) -> f32 {
    (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
}

/// 4x4 overlapping 9x9 subregions of Gaussian weighted, rotated gradients
fn msurf_descriptor(kp: &NonlinearKeypoint, e: &Evolution, extended: bool) -> Vec<f32> {
    let ratio = e.ratio();
    let scale = (0.5 * kp.size / ratio).round().max(1.0);
    let xf = kp.x / ratio;
    let yf = kp.y / ratio;
    let (si, co) = kp.angle.sin_cos();
    let per_cell = if extended { 8 } else { 4 };
    let mut desc = Vec::with_capacity(16 * per_cell);

    let mut cx = -0.5f32;
    let mut i = -8i32;
    while i < 12 {
        i -= 4;
        cx += 1.0;
        let mut cy = -0.5f32;
        let mut j = -8i32;
        while j < 12 {
            j -= 4;
            cy += 1.0;
            let ky = (i + 5) as f32;
            let kx = (j + 5) as f32;
            let ys = yf + (kx * scale * co + ky * scale * si);
            let xs = xf + (-kx * scale * si + ky * scale * co);

            let mut acc = [0.0f32; 8];
            for k in i..i + 9 {
                for l in j..j + 9 {
                    let (kf, lf) = (k as f32, l as f32);
                    let sy = yf + (lf * scale * co + kf * scale * si);
                    let sx = xf + (-lf * scale * si + kf * scale * co);
                    let weight = gaussian(xs - sx, ys - sy, 2.5 * scale);
                    let rx = preprocessing::bilinear(&e.lx, sx, sy);
                    let ry = preprocessing::bilinear(&e.ly, sx, sy);
                    let rrx = weight * (-rx * si + ry * co);
                    let rry = weight * (rx * co + ry * si);
                    if extended {
                        if rry >= 0.0 {
                            acc[0] += rrx;
                            acc[1] += rrx.abs();
                        } else {
                            acc[2] += rrx;
                            acc[3] += rrx.abs();
                        }
                        if rrx >= 0.0 {
                            acc[4] += rry;
                            acc[5] += rry.abs();
                        } else {
                            acc[6] += rry;
                            acc[7] += rry.abs();
                        }
                    } else {
                        acc[0] += rrx;
                        acc[1] += rry;
                        acc[2] += rrx.abs();
                        acc[3] += rry.abs();
                    }
                }
            }

            let cell_weight = gaussian(cx - 2.0, cy - 2.0, 1.5);
            desc.extend(acc[..per_cell].iter().map(|v| v * cell_weight));
            j += 9;
        }
        i += 9;
    }

    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in desc.iter_mut() {
            *v /= norm;
        }
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn create_blob_image(size: u32) -> GrayImage {
        ImageBuffer::from_fn(size, size, |x, y| {
            let centers = [(40.0, 50.0, 6.0), (100.0, 90.0, 9.0), (70.0, 120.0, 5.0), (120.0, 40.0, 7.0)];
            let mut v = 60.0;
            for (cx, cy, r) in centers {
                let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                v += 150.0 * (-d2 / (2.0 * r * r)).exp();
            }
            Luma([v.min(255.0) as u8])
        })
    }

    #[test]
    fn test_descriptor_rows_are_unit_length() {
        let kaze = KazeExtractor::new(KazeParams::default()).unwrap();
        let (kps, desc) = kaze.detect_and_compute(&create_blob_image(160)).unwrap();
        assert_eq!(desc.rows(), kps.len());
        assert_eq!(desc.cols(), 64);
        for row in desc.iter_rows() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_extended_descriptor_width() {
        let params = KazeParams { extended: true, upright: true, ..KazeParams::default() };
        let kaze = KazeExtractor::new(params).unwrap();
        let (kps, desc) = kaze.detect_and_compute(&create_blob_image(160)).unwrap();
        assert_eq!(desc.cols(), 128);
        assert!(kps.iter().all(|kp| kp.angle == 0.0));
    }
}
