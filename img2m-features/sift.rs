//! Scale-invariant feature transform.
//!
//! Follows the OpenCV `SIFT` conventions so descriptors are interchangeable
//! with other tools: the input is upsampled 2x to seed the Gaussian pyramid,
//! extrema are refined with a quadratic fit, orientation histograms are
//! smoothed with a [1 4 6 4 1] kernel and the 4x4x8 descriptor is clipped at
//! 0.2 and scaled into the byte range.

use crate::config::SiftParams;
use crate::error::FeatureResult;
use crate::preprocessing::{self, GrayF32};
use image::imageops::FilterType;
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::debug;
use rayon::prelude::*;
use std::f32::consts::PI;

pub const DESCRIPTOR_SIZE: usize = DESCR_WIDTH * DESCR_WIDTH * DESCR_HIST_BINS;

const DESCR_WIDTH: usize = 4;
const DESCR_HIST_BINS: usize = 8;
const DESCR_SCL_FCTR: f32 = 3.0;
const DESCR_MAG_THR: f32 = 0.2;
const INT_DESCR_FCTR: f32 = 512.0;

const ORI_HIST_BINS: usize = 36;
const ORI_SIG_FCTR: f32 = 1.5;
const ORI_RADIUS: f32 = 3.0 * ORI_SIG_FCTR;
const ORI_PEAK_RATIO: f32 = 0.8;

const IMG_BORDER: usize = 5;
const MAX_INTERP_STEPS: usize = 5;
/// Assumed blur of the input image
const INIT_SIGMA: f32 = 0.5;

/// Keypoint with its pyramid location, coordinates in the seed (2x) frame
#[derive(Debug, Clone, Copy)]
struct PyramidKeypoint {
    x: f32,
    y: f32,
    size: f32,
    angle: f32,
    response: f32,
    octave: usize,
    layer: usize,
}

impl PyramidKeypoint {
    fn to_keypoint(self) -> Keypoint {
        Keypoint::new(self.x * 0.5, self.y * 0.5, self.size * 0.5, self.angle, self.response)
    }
}

/// Gaussian pyramid and its difference-of-Gaussians
struct ScaleSpace {
    gaussians: Vec<Vec<GrayF32>>,
    dogs: Vec<Vec<GrayF32>>,
}

/// SIFT detector and descriptor extractor
pub struct SiftExtractor {
    params: SiftParams,
}

impl SiftExtractor {
    pub fn new(params: SiftParams) -> FeatureResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SiftParams {
        &self.params
    }

    /// Detect keypoints and compute raw SIFT descriptors (values 0-255 as f32)
    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
        preprocessing::validate_image(img)?;
        let space = self.build_scale_space(img);

        let mut keypoints = self.find_scale_space_extrema(&space);
        debug!("SIFT: {} raw keypoints", keypoints.len());

        remove_duplicates(&mut keypoints);
        if self.params.nfeatures > 0 && keypoints.len() > self.params.nfeatures {
            keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));
            keypoints.truncate(self.params.nfeatures);
        }

        let descriptors = compute_descriptors(&space, &keypoints)?;
        let keypoints = keypoints.into_iter().map(PyramidKeypoint::to_keypoint).collect();
        Ok((keypoints, descriptors))
    }

    /// Compute descriptors for keypoints given in the frame of `img`.
    ///
    /// The pyramid octave and layer are recovered from the keypoint size.
    pub fn compute(&self, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<Descriptors<f32>> {
        preprocessing::validate_image(img)?;
        let space = self.build_scale_space(img);
        let n_octaves = space.gaussians.len();
        let layers = self.params.n_octave_layers as f32;
        let sigma = self.params.sigma;

        let located: Vec<PyramidKeypoint> = keypoints
            .iter()
            .map(|kp| {
                let s = (kp.size.max(1e-6) / sigma).log2() * layers;
                let octave = ((s - 0.5) / layers).floor().clamp(0.0, (n_octaves - 1) as f32) as usize;
                let layer = (s - octave as f32 * layers)
                    .round()
                    .clamp(1.0, self.params.n_octave_layers as f32) as usize;
                PyramidKeypoint {
                    x: kp.x * 2.0,
                    y: kp.y * 2.0,
                    size: kp.size * 2.0,
                    angle: kp.angle,
                    response: kp.response,
                    octave,
                    layer,
                }
            })
            .collect();

        compute_descriptors(&space, &located)
    }

    fn build_scale_space(&self, img: &GrayImage) -> ScaleSpace {
        let p = &self.params;
        let base = self.create_seed_image(img);

        let min_dim = base.width().min(base.height()) as f32;
        let computed = ((min_dim.log2() - 2.0).round() as i64 + 1).max(1) as usize;
        let n_octaves = computed.min(p.num_octaves).max(1);

        let n_layers = p.n_octave_layers;
        let k = 2f32.powf(1.0 / n_layers as f32);
        let mut sig = vec![p.sigma; n_layers + 3];
        for (i, s) in sig.iter_mut().enumerate().skip(1) {
            let sig_prev = k.powi(i as i32 - 1) * p.sigma;
            let sig_total = sig_prev * k;
            *s = (sig_total * sig_total - sig_prev * sig_prev).sqrt();
        }

        let mut gaussians: Vec<Vec<GrayF32>> = Vec::with_capacity(n_octaves);
        for o in 0..n_octaves {
            let mut octave: Vec<GrayF32> = Vec::with_capacity(n_layers + 3);
            let first = if o == 0 {
                base.clone()
            } else {
                preprocessing::downsample_nearest(&gaussians[o - 1][n_layers])
            };
            octave.push(first);
            for s in sig.iter().skip(1) {
                let next = preprocessing::blur(&octave[octave.len() - 1], *s);
                octave.push(next);
            }
            gaussians.push(octave);
        }

        let dogs = gaussians
            .par_iter()
            .map(|octave| octave.windows(2).map(|w| difference(&w[1], &w[0])).collect())
            .collect();

        ScaleSpace { gaussians, dogs }
    }

    /// 2x upsampled and blurred base image
    fn create_seed_image(&self, img: &GrayImage) -> GrayF32 {
        let unit = preprocessing::to_unit_float(img);
        let filter = if self.params.enable_precise_upscale {
            FilterType::CatmullRom
        } else {
            FilterType::Triangle
        };
        let doubled = preprocessing::resize(&unit, unit.width() * 2, unit.height() * 2, filter);
        let sigma = self.params.sigma;
        let sig_diff = (sigma * sigma - INIT_SIGMA * INIT_SIGMA * 4.0).max(0.01).sqrt();
        preprocessing::blur(&doubled, sig_diff)
    }

    fn find_scale_space_extrema(&self, space: &ScaleSpace) -> Vec<PyramidKeypoint> {
        let n_layers = self.params.n_octave_layers;
        let threshold = (0.5 * self.params.contrast_threshold / n_layers as f32 * 255.0).floor() / 255.0;

        let levels: Vec<(usize, usize)> = (0..space.dogs.len())
            .flat_map(|o| (1..=n_layers).map(move |layer| (o, layer)))
            .collect();

        levels
            .into_par_iter()
            .flat_map_iter(|(o, layer)| self.extrema_in_layer(space, o, layer, threshold))
            .collect()
    }

    fn extrema_in_layer(&self, space: &ScaleSpace, o: usize, layer: usize, threshold: f32) -> Vec<PyramidKeypoint> {
        let dog = &space.dogs[o];
        let (w, h) = (dog[layer].width() as usize, dog[layer].height() as usize);
        let mut found = Vec::new();
        if w <= 2 * IMG_BORDER || h <= 2 * IMG_BORDER {
            return found;
        }

        let prev = dog[layer - 1].as_raw();
        let curr = dog[layer].as_raw();
        let next = dog[layer + 1].as_raw();

        for r in IMG_BORDER..h - IMG_BORDER {
            for c in IMG_BORDER..w - IMG_BORDER {
                let val = curr[r * w + c];
                if val.abs() <= threshold || !is_extremum(prev, curr, next, w, r, c, val) {
                    continue;
                }
                let Some(refined) = self.adjust_local_extremum(dog, o, layer, r, c) else {
                    continue;
                };
                self.assign_orientations(space, refined, &mut found);
            }
        }
        found
    }

    /// Quadratic refinement with contrast and edge rejection
    fn adjust_local_extremum(
        &self,
        dog: &[GrayF32],
        octave: usize,
        mut layer: usize,
        mut r: usize,
        mut c: usize,
    ) -> Option<Refined> {
        let n_layers = self.params.n_octave_layers;
        let (w, h) = (dog[layer].width() as usize, dog[layer].height() as usize);
        let mut offset = [0.0f32; 3];
        let mut converged = false;

        for _ in 0..MAX_INTERP_STEPS {
            let (grad, hess) = derivatives(dog, layer, r, c, w);
            let x = solve3(&hess, &grad)?;
            offset = [-x[0], -x[1], -x[2]];

            if offset.iter().all(|v| v.abs() < 0.5) {
                converged = true;
                break;
            }
            if offset.iter().any(|v| v.abs() > (i32::MAX / 3) as f32) {
                return None;
            }

            let nc = c as i64 + offset[0].round() as i64;
            let nr = r as i64 + offset[1].round() as i64;
            let nl = layer as i64 + offset[2].round() as i64;
            if nl < 1
                || nl > n_layers as i64
                || nc < IMG_BORDER as i64
                || nc >= (w - IMG_BORDER) as i64
                || nr < IMG_BORDER as i64
                || nr >= (h - IMG_BORDER) as i64
            {
                return None;
            }
            c = nc as usize;
            r = nr as usize;
            layer = nl as usize;
        }
        if !converged {
            return None;
        }

        let (grad, hess) = derivatives(dog, layer, r, c, w);
        let t = grad[0] * offset[0] + grad[1] * offset[1] + grad[2] * offset[2];
        let contrast = dog[layer].as_raw()[r * w + c] + t * 0.5;
        if contrast.abs() * (n_layers as f32) < self.params.contrast_threshold {
            return None;
        }

        let (dxx, dyy, dxy) = (hess[0][0], hess[1][1], hess[0][1]);
        let tr = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let edge = self.params.edge_threshold;
        if det <= 0.0 || tr * tr * edge >= (edge + 1.0) * (edge + 1.0) * det {
            return None;
        }

        let octave_scale = (1usize << octave) as f32;
        let scl_octv = self.params.sigma * 2f32.powf((layer as f32 + offset[2]) / n_layers as f32);
        Some(Refined {
            x: (c as f32 + offset[0]) * octave_scale,
            y: (r as f32 + offset[1]) * octave_scale,
            size: scl_octv * octave_scale * 2.0,
            scl_octv,
            response: contrast.abs(),
            octave,
            layer,
            r,
            c,
        })
    }

    fn assign_orientations(&self, space: &ScaleSpace, kp: Refined, out: &mut Vec<PyramidKeypoint>) {
        let img = &space.gaussians[kp.octave][kp.layer];
        let hist = orientation_histogram(
            img,
            kp.c as i64,
            kp.r as i64,
            (ORI_RADIUS * kp.scl_octv).round() as i64,
            ORI_SIG_FCTR * kp.scl_octv,
        );
        let omax = hist.iter().copied().fold(0.0f32, f32::max);
        let mag_thr = omax * ORI_PEAK_RATIO;
        let n = ORI_HIST_BINS;

        for j in 0..n {
            let l = if j > 0 { j - 1 } else { n - 1 };
            let r2 = if j < n - 1 { j + 1 } else { 0 };
            if hist[j] > hist[l] && hist[j] > hist[r2] && hist[j] >= mag_thr {
                let mut bin = j as f32 + 0.5 * (hist[l] - hist[r2]) / (hist[l] - 2.0 * hist[j] + hist[r2]);
                if bin < 0.0 {
                    bin += n as f32;
                } else if bin >= n as f32 {
                    bin -= n as f32;
                }
                let mut angle = 360.0 - (360.0 / n as f32) * bin;
                if (angle - 360.0).abs() < f32::EPSILON {
                    angle = 0.0;
                }
                out.push(PyramidKeypoint {
                    x: kp.x,
                    y: kp.y,
                    size: kp.size,
                    angle,
                    response: kp.response,
                    octave: kp.octave,
                    layer: kp.layer,
                });
            }
        }
    }
}

/// Refined extremum before orientation assignment
#[derive(Debug, Clone, Copy)]
struct Refined {
    x: f32,
    y: f32,
    size: f32,
    scl_octv: f32,
    response: f32,
    octave: usize,
    layer: usize,
    r: usize,
    c: usize,
}

fn difference(a: &GrayF32, b: &GrayF32) -> GrayF32 {
    let data = a.as_raw().iter().zip(b.as_raw()).map(|(x, y)| x - y).collect();
    GrayF32::from_raw(a.width(), a.height(), data).unwrap_or_else(|| GrayF32::new(a.width(), a.height()))
}

#[inline]
fn is_extremum(prev: &[f32], curr: &[f32], next: &[f32], w: usize, r: usize, c: usize, val: f32) -> bool {
    let idx = r * w + c;
    let neighbours = [idx - w - 1, idx - w, idx - w + 1, idx - 1, idx, idx + 1, idx + w - 1, idx + w, idx + w + 1];
    if val > 0.0 {
        neighbours.iter().all(|&i| {
            val >= prev[i] && val >= next[i] && (i == idx || val >= curr[i])
        })
    } else {
        neighbours.iter().all(|&i| {
            val <= prev[i] && val <= next[i] && (i == idx || val <= curr[i])
        })
    }
}

/// Gradient `(dx, dy, ds)` and Hessian of the DoG stack at a sample
fn derivatives(dog: &[GrayF32], layer: usize, r: usize, c: usize, w: usize) -> ([f32; 3], [[f32; 3]; 3]) {
    let img = dog[layer].as_raw();
    let prv = dog[layer - 1].as_raw();
    let nxt = dog[layer + 1].as_raw();
    let at = |d: &[f32], rr: usize, cc: usize| d[rr * w + cc];

    let dx = (at(img, r, c + 1) - at(img, r, c - 1)) * 0.5;
    let dy = (at(img, r + 1, c) - at(img, r - 1, c)) * 0.5;
    let ds = (at(nxt, r, c) - at(prv, r, c)) * 0.5;

    let v2 = at(img, r, c) * 2.0;
    let dxx = at(img, r, c + 1) + at(img, r, c - 1) - v2;
    let dyy = at(img, r + 1, c) + at(img, r - 1, c) - v2;
    let dss = at(nxt, r, c) + at(prv, r, c) - v2;
    let dxy = (at(img, r + 1, c + 1) - at(img, r + 1, c - 1) - at(img, r - 1, c + 1) + at(img, r - 1, c - 1)) * 0.25;
    let dxs = (at(nxt, r, c + 1) - at(nxt, r, c - 1) - at(prv, r, c + 1) + at(prv, r, c - 1)) * 0.25;
    let dys = (at(nxt, r + 1, c) - at(nxt, r - 1, c) - at(prv, r + 1, c) + at(prv, r - 1, c)) * 0.25;

    ([dx, dy, ds], [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]])
}

/// Solve `H x = b` by Cramer's rule, `None` when singular
fn solve3(h: &[[f32; 3]; 3], b: &[f32; 3]) -> Option<[f32; 3]> {
    let det = h[0][0] * (h[1][1] * h[2][2] - h[1][2] * h[2][1]) - h[0][1] * (h[1][0] * h[2][2] - h[1][2] * h[2][0])
        + h[0][2] * (h[1][0] * h[2][1] - h[1][1] * h[2][0]);
    if det.abs() < f32::EPSILON * 1e-3 || !det.is_finite() {
        return None;
    }
    let mut out = [0.0f32; 3];
    for (col, value) in out.iter_mut().enumerate() {
        let mut m = *h;
        for row in 0..3 {
            m[row][col] = b[row];
        }
        let d = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        *value = d / det;
    }
    Some(out)
}

/// Smoothed 36-bin gradient orientation histogram around `(x, y)`
fn orientation_histogram(img: &GrayF32, x: i64, y: i64, radius: i64, sigma: f32) -> [f32; ORI_HIST_BINS] {
    let n = ORI_HIST_BINS;
    let (w, h) = (img.width() as i64, img.height() as i64);
    let data = img.as_raw();
    let expf_scale = -1.0 / (2.0 * sigma * sigma);
    let mut temp = [0.0f32; ORI_HIST_BINS + 4];

    for i in -radius..=radius {
        let yy = y + i;
        if yy <= 0 || yy >= h - 1 {
            continue;
        }
        for j in -radius..=radius {
            let xx = x + j;
            if xx <= 0 || xx >= w - 1 {
                continue;
            }
            let idx = (yy * w + xx) as usize;
            let dx = data[idx + 1] - data[idx - 1];
            let dy = data[idx - w as usize] - data[idx + w as usize];
            let weight = (((i * i + j * j) as f32) * expf_scale).exp();
            let mag = (dx * dx + dy * dy).sqrt();
            let ori = dy.atan2(dx).to_degrees();

            let mut bin = ((n as f32 / 360.0) * ori).round() as i64;
            if bin >= n as i64 {
                bin -= n as i64;
            }
            if bin < 0 {
                bin += n as i64;
            }
            temp[bin as usize + 2] += weight * mag;
        }
    }

    temp[1] = temp[n + 1];
    temp[0] = temp[n];
    temp[n + 2] = temp[2];
    temp[n + 3] = temp[3];

    let mut hist = [0.0f32; ORI_HIST_BINS];
    for i in 0..n {
        let t = i + 2;
        hist[i] = (temp[t - 2] + temp[t + 2]) * (1.0 / 16.0) + (temp[t - 1] + temp[t + 1]) * (4.0 / 16.0) + temp[t] * (6.0 / 16.0);
    }
    hist
}

fn remove_duplicates(keypoints: &mut Vec<PyramidKeypoint>) {
    keypoints.sort_by(|a, b| {
        a.x.total_cmp(&b.x)
            .then(a.y.total_cmp(&b.y))
            .then(b.size.total_cmp(&a.size))
            .then(a.angle.total_cmp(&b.angle))
            .then(b.response.total_cmp(&a.response))
    });
    keypoints.dedup_by(|b, a| a.x == b.x && a.y == b.y && a.size == b.size && a.angle == b.angle);
}

fn compute_descriptors(space: &ScaleSpace, keypoints: &[PyramidKeypoint]) -> FeatureResult<Descriptors<f32>> {
    let rows: Vec<[f32; DESCRIPTOR_SIZE]> = keypoints
        .par_iter()
        .map(|kp| {
            let img = &space.gaussians[kp.octave][kp.layer];
            let scale = 1.0 / (1usize << kp.octave) as f32;
            let size = kp.size * scale;
            let mut angle = 360.0 - kp.angle;
            if (angle - 360.0).abs() < f32::EPSILON {
                angle = 0.0;
            }
            descriptor(img, kp.x * scale, kp.y * scale, angle, size * 0.5)
        })
        .collect();
    Ok(Descriptors::from_rows(DESCRIPTOR_SIZE, &rows)?)
}

/// 4x4 spatial cells of 8-bin orientation histograms with trilinear weights
fn descriptor(img: &GrayF32, ptx: f32, pty: f32, angle: f32, scl: f32) -> [f32; DESCRIPTOR_SIZE] {
    let d = DESCR_WIDTH;
    let n = DESCR_HIST_BINS;
    let (w, h) = (img.width() as i64, img.height() as i64);
    let data = img.as_raw();

    let px = ptx.round() as i64;
    let py = pty.round() as i64;
    let (sin_a, cos_a) = (angle * PI / 180.0).sin_cos();
    let bins_per_deg = n as f32 / 360.0;
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = DESCR_SCL_FCTR * scl;
    let diag_limit = ((w * w + h * h) as f32).sqrt();
    let radius = ((hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5).round()).min(diag_limit) as i64;
    let cos_t = cos_a / hist_width;
    let sin_t = sin_a / hist_width;

    let mut hist = vec![0.0f32; (d + 2) * (d + 2) * (n + 2)];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            let r = py + i;
            let c = px + j;

            if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                continue;
            }
            if r <= 0 || r >= h - 1 || c <= 0 || c >= w - 1 {
                continue;
            }

            let idx = (r * w + c) as usize;
            let dx = data[idx + 1] - data[idx - 1];
            let dy = data[idx - w as usize] - data[idx + w as usize];
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let mag = (dx * dx + dy * dy).sqrt() * weight;
            let mut ori = dy.atan2(dx).to_degrees();
            if ori < 0.0 {
                ori += 360.0;
            }
            let obin = (ori - angle) * bins_per_deg;

            let r0 = rbin.floor();
            let c0 = cbin.floor();
            let o0 = obin.floor();
            let (rf, cf, of) = (rbin - r0, cbin - c0, obin - o0);
            let mut o0 = o0 as i64;
            if o0 < 0 {
                o0 += n as i64;
            }
            if o0 >= n as i64 {
                o0 -= n as i64;
            }

            let v_r1 = mag * rf;
            let v_r0 = mag - v_r1;
            let v_rc11 = v_r1 * cf;
            let v_rc10 = v_r1 - v_rc11;
            let v_rc01 = v_r0 * cf;
            let v_rc00 = v_r0 - v_rc01;
            let v_rco111 = v_rc11 * of;
            let v_rco110 = v_rc11 - v_rco111;
            let v_rco101 = v_rc10 * of;
            let v_rco100 = v_rc10 - v_rco101;
            let v_rco011 = v_rc01 * of;
            let v_rco010 = v_rc01 - v_rco011;
            let v_rco001 = v_rc00 * of;
            let v_rco000 = v_rc00 - v_rco001;

            let base = (((r0 as i64 + 1) as usize * (d + 2)) + (c0 as i64 + 1) as usize) * (n + 2) + o0 as usize;
            let row = (d + 2) * (n + 2);
            hist[base] += v_rco000;
            hist[base + 1] += v_rco001;
            hist[base + n + 2] += v_rco010;
            hist[base + n + 3] += v_rco011;
            hist[base + row] += v_rco100;
            hist[base + row + 1] += v_rco101;
            hist[base + row + n + 2] += v_rco110;
            hist[base + row + n + 3] += v_rco111;
        }
    }

    let mut dst = [0.0f32; DESCRIPTOR_SIZE];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                dst[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }

    let norm = dst.iter().map(|v| v * v).sum::<f32>().sqrt();
    let thr = norm * DESCR_MAG_THR;
    for v in dst.iter_mut() {
        *v = v.min(thr);
    }
    let norm = dst.iter().map(|v| v * v).sum::<f32>().sqrt();
    let scale = INT_DESCR_FCTR / norm.max(f32::EPSILON);
    for v in dst.iter_mut() {
        *v = (*v * scale).round().clamp(0.0, 255.0);
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    /// Random blobs on a smooth background
    fn create_textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = Pcg64::seed_from_u64(seed);
        let blobs: Vec<(f32, f32, f32, f32)> = (0..60)
            .map(|_| {
                (
                    rng.gen_range(0.0..width as f32),
                    rng.gen_range(0.0..height as f32),
                    rng.gen_range(2.0..7.0),
                    rng.gen_range(-120.0..120.0),
                )
            })
            .collect();
        ImageBuffer::from_fn(width, height, |x, y| {
            let mut v = 128.0;
            for &(bx, by, r, amp) in &blobs {
                let d2 = (x as f32 - bx).powi(2) + (y as f32 - by).powi(2);
                v += amp * (-d2 / (2.0 * r * r)).exp();
            }
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn test_uniform_image_has_no_keypoints() {
        let sift = SiftExtractor::new(SiftParams::default()).unwrap();
        let img = ImageBuffer::from_pixel(64, 64, Luma([100u8]));
        let (kps, desc) = sift.detect_and_compute(&img).unwrap();
        assert!(kps.is_empty());
        assert_eq!(desc.rows(), 0);
        assert_eq!(desc.cols(), DESCRIPTOR_SIZE);
    }

    #[test]
    fn test_textured_image_produces_descriptors() {
        let sift = SiftExtractor::new(SiftParams::default()).unwrap();
        let img = create_textured_image(128, 128, 7);
        let (kps, desc) = sift.detect_and_compute(&img).unwrap();
        assert!(!kps.is_empty());
        assert_eq!(desc.rows(), kps.len());
        for kp in &kps {
            assert!(kp.x >= 0.0 && kp.x < 128.0 && kp.y >= 0.0 && kp.y < 128.0);
            assert!((0.0..360.0).contains(&kp.angle));
            assert!(kp.size > 0.0);
        }
        assert!(desc.as_slice().iter().all(|v| (0.0..=255.0).contains(v)));
    }

    #[test]
    fn test_nfeatures_limits_output() {
        let params = SiftParams { nfeatures: 5, ..SiftParams::default() };
        let sift = SiftExtractor::new(params).unwrap();
        let (kps, _) = sift.detect_and_compute(&create_textured_image(128, 128, 3)).unwrap();
        assert!(kps.len() <= 5);
    }

    #[test]
    fn test_compute_reproduces_detected_descriptors() {
        let sift = SiftExtractor::new(SiftParams::default()).unwrap();
        let img = create_textured_image(128, 128, 11);
        let (kps, detected) = sift.detect_and_compute(&img).unwrap();
        let recomputed = sift.compute(&img, &kps).unwrap();
        assert_eq!(recomputed.rows(), detected.rows());

        // Layer recovery from the size is exact for sub-bin offsets, so most rows agree
        let identical = detected
            .iter_rows()
            .zip(recomputed.iter_rows())
            .filter(|(a, b)| a == b)
            .count();
        assert!(identical * 2 >= detected.rows());
    }

    #[test]
    fn test_solve3_identity() {
        let h = [[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 8.0]];
        let x = solve3(&h, &[2.0, 4.0, 8.0]).unwrap();
        assert_eq!(x, [1.0, 1.0, 1.0]);
        assert!(solve3(&[[0.0; 3]; 3], &[1.0, 1.0, 1.0]).is_none());
    }
}
