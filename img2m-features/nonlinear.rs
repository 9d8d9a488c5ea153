//! Nonlinear diffusion scale space for KAZE.
//!
//! The image is diffused with the Perona-Malik g2 conductivity using Fast
//! Explicit Diffusion step schedules. Keypoints are maxima of the scale
//! normalized Hessian determinant across space and neighbouring evolutions.

use crate::preprocessing::{self, GrayF32};
use image::GrayImage;
use log::{debug, trace};
use rayon::prelude::*;
use std::f32::consts::PI;

/// Scale space construction options
#[derive(Debug, Clone, Copy)]
pub struct NonlinearOptions {
    pub num_sublevels: u32,
    pub max_octaves: u32,
    pub base_scale_offset: f32,
    pub derivative_factor: f32,
    pub contrast_percentile: f32,
    pub contrast_bins: usize,
    pub detector_threshold: f32,
}

impl NonlinearOptions {
    pub fn new(threshold: f32, max_octaves: usize, num_sublevels: usize) -> Self {
        Self {
            num_sublevels: num_sublevels as u32,
            max_octaves: max_octaves as u32,
            base_scale_offset: 1.6,
            derivative_factor: 1.5,
            contrast_percentile: 0.7,
            contrast_bins: 300,
            detector_threshold: threshold,
        }
    }
}

/// One level of the nonlinear scale space
pub struct Evolution {
    pub etime: f32,
    pub esigma: f32,
    pub octave: u32,
    pub sublevel: u32,
    /// Diffused image
    pub lt: GrayF32,
    pub lsmooth: GrayF32,
    pub lx: GrayF32,
    pub ly: GrayF32,
    pub lxx: GrayF32,
    pub lyy: GrayF32,
    pub lxy: GrayF32,
    /// Scale normalized Hessian determinant
    pub ldet: GrayF32,
    fed_steps: Vec<f32>,
}

impl Evolution {
    fn new(octave: u32, sublevel: u32, options: &NonlinearOptions) -> Self {
        let esigma = options.base_scale_offset
            * 2f32.powf(sublevel as f32 / options.num_sublevels as f32 + octave as f32);
        Self {
            etime: 0.5 * esigma * esigma,
            esigma,
            octave,
            sublevel,
            lt: GrayF32::new(0, 0),
            lsmooth: GrayF32::new(0, 0),
            lx: GrayF32::new(0, 0),
            ly: GrayF32::new(0, 0),
            lxx: GrayF32::new(0, 0),
            lyy: GrayF32::new(0, 0),
            lxy: GrayF32::new(0, 0),
            ldet: GrayF32::new(0, 0),
            fed_steps: Vec::new(),
        }
    }

    /// Size of the derivative filters at this level
    fn sigma_size(&self, derivative_factor: f32) -> u32 {
        let ratio = (1u32 << self.octave) as f32;
        ((self.esigma * derivative_factor / ratio).round() as u32).max(1)
    }

    #[inline]
    pub fn ratio(&self) -> f32 {
        (1u32 << self.octave) as f32
    }
}

/// Keypoint candidate in the nonlinear scale space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonlinearKeypoint {
    /// Position in input image coordinates
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub response: f32,
    /// Dominant orientation in radians, `[0, 2π)`
    pub angle: f32,
    pub octave: u32,
    /// Index of the evolution the keypoint was found in
    pub level: usize,
}

impl NonlinearKeypoint {
    pub fn to_keypoint(&self) -> img2m_core::Keypoint {
        let mut degrees = self.angle.to_degrees();
        if degrees >= 360.0 {
            degrees -= 360.0;
        }
        img2m_core::Keypoint::new(self.x, self.y, self.size, degrees, self.response)
    }
}

pub struct NonlinearScaleSpace {
    pub evolutions: Vec<Evolution>,
    pub options: NonlinearOptions,
}

impl NonlinearScaleSpace {
    /// Allocate evolutions and diffuse the input image through all of them
    pub fn build(img: &GrayImage, options: NonlinearOptions) -> Self {
        let mut evolutions = allocate_evolutions(img.width(), img.height(), &options);
        if !evolutions.is_empty() {
            create_scale_space(&mut evolutions, &preprocessing::to_unit_float(img), &options);
        }
        Self { evolutions, options }
    }

    /// Detector response, extrema search, subpixel refinement and orientation
    pub fn detect(&mut self, upright: bool) -> Vec<NonlinearKeypoint> {
        if self.evolutions.is_empty() {
            return Vec::new();
        }
        self.compute_detector_response();
        let candidates = self.find_extrema();
        let mut keypoints = self.subpixel_refinement(&candidates);
        if !upright {
            keypoints.par_iter_mut().for_each(|kp| kp.angle = main_orientation(kp, &self.evolutions));
        }
        keypoints
    }

    fn compute_detector_response(&mut self) {
        let factor = self.options.derivative_factor;
        self.evolutions.par_iter_mut().for_each(|e| {
            let sigma_size = e.sigma_size(factor);
            e.lx = scharr_horizontal(&e.lsmooth, sigma_size);
            e.ly = scharr_vertical(&e.lsmooth, sigma_size);
            e.lxx = scharr_horizontal(&e.lx, sigma_size);
            e.lyy = scharr_vertical(&e.ly, sigma_size);
            e.lxy = scharr_vertical(&e.lx, sigma_size);

            let quat = (sigma_size as f32).powi(4);
            let data = e
                .lxx
                .as_raw()
                .iter()
                .zip(e.lyy.as_raw())
                .zip(e.lxy.as_raw())
                .map(|((xx, yy), xy)| (xx * yy - xy * xy) * quat)
                .collect();
            e.ldet = GrayF32::from_raw(e.lxx.width(), e.lxx.height(), data)
                .unwrap_or_else(|| GrayF32::new(e.lxx.width(), e.lxx.height()));
        });
    }

    /// Spatial 4-neighbour maxima, merged with neighbouring evolutions
    fn find_extrema(&self) -> Vec<NonlinearKeypoint> {
        let smax = 10.0 * 2f32.sqrt();
        let threshold = self.options.detector_threshold;
        let mut cache: Vec<NonlinearKeypoint> = Vec::new();

        for (level, e) in self.evolutions.iter().enumerate() {
            let (w, h) = (e.ldet.width() as usize, e.ldet.height() as usize);
            if w < 3 || h < 3 {
                continue;
            }
            let det = e.ldet.as_raw();
            let ratio = e.ratio();
            let size = e.esigma * self.options.derivative_factor;
            let sigma_size = (size / ratio).round();

            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    let i = y * w + x;
                    let v = det[i];
                    if !(v > threshold && v > det[i - 1] && v > det[i + 1] && v > det[i - w] && v > det[i + w]) {
                        continue;
                    }

                    let px = x as f32 * ratio;
                    let py = y as f32 * ratio;
                    let mut repeated = None;
                    let mut is_extremum = true;
                    for (k, prev) in cache.iter().enumerate() {
                        if prev.level == level || prev.level + 1 == level {
                            let dist = (px - prev.x).powi(2) + (py - prev.y).powi(2);
                            if dist <= size * size {
                                if v > prev.response {
                                    repeated = Some(k);
                                } else {
                                    is_extremum = false;
                                }
                                break;
                            }
                        }
                    }
                    if !is_extremum {
                        continue;
                    }

                    let left = (x as f32 - smax * sigma_size).round() - 1.0;
                    let right = (x as f32 + smax * sigma_size).round() + 1.0;
                    let up = (y as f32 - smax * sigma_size).round() - 1.0;
                    let down = (y as f32 + smax * sigma_size).round() + 1.0;
                    if left < 0.0 || right >= w as f32 || up < 0.0 || down >= h as f32 {
                        continue;
                    }

                    let kp = NonlinearKeypoint {
                        x: px + 0.5 * (ratio - 1.0),
                        y: py + 0.5 * (ratio - 1.0),
                        size,
                        response: v.abs(),
                        angle: 0.0,
                        octave: e.octave,
                        level,
                    };
                    match repeated {
                        Some(k) => cache[k] = kp,
                        None => cache.push(kp),
                    }
                }
            }
        }

        // Drop points dominated by the next coarser evolution
        let out: Vec<NonlinearKeypoint> = cache
            .iter()
            .enumerate()
            .filter(|(i, kp)| {
                !cache[*i..].iter().any(|other| {
                    other.level == kp.level + 1
                        && (kp.x - other.x).powi(2) + (kp.y - other.y).powi(2) <= kp.size * kp.size
                })
            })
            .map(|(_, kp)| *kp)
            .collect();
        debug!("Nonlinear scale space: {} extrema", out.len());
        out
    }

    fn subpixel_refinement(&self, candidates: &[NonlinearKeypoint]) -> Vec<NonlinearKeypoint> {
        candidates
            .iter()
            .filter_map(|kp| {
                let e = &self.evolutions[kp.level];
                let ratio = e.ratio();
                let w = e.ldet.width() as usize;
                let x = (kp.x / ratio).round() as usize;
                let y = (kp.y / ratio).round() as usize;
                let d = e.ldet.as_raw();
                let at = |xx: usize, yy: usize| d[yy * w + xx];

                let dx = 0.5 * (at(x + 1, y) - at(x - 1, y));
                let dy = 0.5 * (at(x, y + 1) - at(x, y - 1));
                let dxx = at(x + 1, y) + at(x - 1, y) - 2.0 * at(x, y);
                let dyy = at(x, y + 1) + at(x, y - 1) - 2.0 * at(x, y);
                let dxy = 0.25 * (at(x + 1, y + 1) + at(x - 1, y - 1)) - 0.25 * (at(x + 1, y - 1) + at(x - 1, y + 1));

                let det = dxx * dyy - dxy * dxy;
                if det.abs() < f32::EPSILON {
                    return None;
                }
                let ox = -(dyy * dx - dxy * dy) / det;
                let oy = -(dxx * dy - dxy * dx) / det;
                if ox.abs() > 1.0 || oy.abs() > 1.0 {
                    return None;
                }
                Some(NonlinearKeypoint {
                    x: (x as f32 + ox) * ratio + 0.5 * (ratio - 1.0),
                    y: (y as f32 + oy) * ratio + 0.5 * (ratio - 1.0),
                    ..*kp
                })
            })
            .collect()
    }
}

fn allocate_evolutions(width: u32, height: u32, options: &NonlinearOptions) -> Vec<Evolution> {
    let mut evolutions: Vec<Evolution> = (0..options.max_octaves)
        .filter_map(|octave| {
            let level_w = width >> octave;
            let level_h = height >> octave;
            let smallest = level_w.min(level_h);
            if smallest < 40 {
                return None;
            }
            let sublevels = if smallest < 80 { 1 } else { options.num_sublevels };
            Some((0..sublevels).map(move |s| Evolution::new(octave, s, options)))
        })
        .flatten()
        .collect();

    for i in 1..evolutions.len() {
        let ttime = evolutions[i].etime - evolutions[i - 1].etime;
        evolutions[i].fed_steps = fed_tau_by_process_time(ttime, 0.25);
        trace!("{} FED steps in evolution {}", evolutions[i].fed_steps.len(), i);
    }
    evolutions
}

fn create_scale_space(evolutions: &mut [Evolution], image: &GrayF32, options: &NonlinearOptions) {
    evolutions[0].lt = preprocessing::blur(image, options.base_scale_offset);
    evolutions[0].lsmooth = evolutions[0].lt.clone();
    let mut contrast = contrast_factor(&evolutions[0].lsmooth, options.contrast_percentile, options.contrast_bins);
    debug!("Initial contrast factor {}", contrast);

    for i in 1..evolutions.len() {
        let lt = if evolutions[i].octave > evolutions[i - 1].octave {
            contrast *= 0.75;
            preprocessing::half_size(&evolutions[i - 1].lt)
        } else {
            evolutions[i - 1].lt.clone()
        };
        let e = &mut evolutions[i];
        e.lt = lt;
        e.lsmooth = preprocessing::blur(&e.lt, 1.0);
        let lx = scharr_horizontal(&e.lsmooth, 1);
        let ly = scharr_vertical(&e.lsmooth, 1);
        let flow = pm_g2(&lx, &ly, contrast);
        for &tau in &e.fed_steps {
            diffusion_step(&mut e.lt, &flow, tau);
        }
    }
}

/// Fast Explicit Diffusion step sizes covering `total_time`
pub fn fed_tau_by_process_time(total_time: f32, tau_max: f32) -> Vec<f32> {
    if total_time <= 0.0 {
        return Vec::new();
    }
    let n = ((3.0 * total_time / tau_max + 0.25).sqrt() - 0.5).ceil().max(1.0) as usize;
    let scale = 3.0 * total_time / (tau_max * (n * n + n) as f32);
    (0..n)
        .map(|i| {
            let c = (PI * (2 * i + 1) as f32 / (4 * n + 2) as f32).cos();
            scale * tau_max / (2.0 * c * c)
        })
        .collect()
}

/// Gradient magnitude percentile used as the diffusion contrast
pub fn contrast_factor(image: &GrayF32, percentile: f32, bins: usize) -> f32 {
    let smooth = preprocessing::blur(image, 1.0);
    let lx = scharr_horizontal(&smooth, 1);
    let ly = scharr_vertical(&smooth, 1);
    let (w, h) = (smooth.width() as usize, smooth.height() as usize);
    let magnitude = |x: usize, y: usize| {
        let i = y * w + x;
        (lx.as_raw()[i].powi(2) + ly.as_raw()[i].powi(2)).sqrt()
    };

    let interior = || (1..h.saturating_sub(1)).flat_map(move |y| (1..w.saturating_sub(1)).map(move |x| (x, y)));
    let hmax = interior().map(|(x, y)| magnitude(x, y)).fold(0.0f32, f32::max);
    if hmax <= 0.0 {
        return 0.03;
    }

    let mut histogram = vec![0usize; bins];
    let mut points = 0usize;
    for (x, y) in interior() {
        let m = magnitude(x, y);
        if m != 0.0 {
            let bin = (((bins as f32) * (m / hmax)).floor() as usize).min(bins - 1);
            histogram[bin] += 1;
            points += 1;
        }
    }

    let threshold = (points as f32 * percentile) as usize;
    let mut k = 0;
    let mut accumulated = 0;
    while accumulated < threshold && k < bins {
        accumulated += histogram[k];
        k += 1;
    }
    if accumulated >= threshold {
        hmax * k as f32 / bins as f32
    } else {
        0.03
    }
}

/// Perona-Malik conductivity `1 / (1 + |∇L|² / k²)`
pub fn pm_g2(lx: &GrayF32, ly: &GrayF32, k: f32) -> GrayF32 {
    let inv_k2 = 1.0 / (k * k).max(f32::EPSILON);
    let data = lx
        .as_raw()
        .iter()
        .zip(ly.as_raw())
        .map(|(x, y)| 1.0 / (1.0 + inv_k2 * (x * x + y * y)))
        .collect();
    GrayF32::from_raw(lx.width(), lx.height(), data).unwrap_or_else(|| GrayF32::new(lx.width(), lx.height()))
}

/// One explicit diffusion step with a 3x3 stencil
fn diffusion_step(lt: &mut GrayF32, flow: &GrayF32, step: f32) {
    let (w, h) = (lt.width() as usize, lt.height() as usize);
    let c = flow.as_raw();
    let src = lt.as_raw().clone();
    let out: &mut [f32] = &mut **lt;

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let mut delta = 0.0;
            if x + 1 < w {
                delta += (c[i] + c[i + 1]) * (src[i + 1] - src[i]);
            }
            if x > 0 {
                delta -= (c[i - 1] + c[i]) * (src[i] - src[i - 1]);
            }
            if y + 1 < h {
                delta += (c[i] + c[i + w]) * (src[i + w] - src[i]);
            }
            if y > 0 {
                delta -= (c[i - w] + c[i]) * (src[i] - src[i - w]);
            }
            out[i] = src[i] + 0.5 * step * delta;
        }
    }
}

fn scharr_kernel(sigma_size: u32, main: bool) -> Vec<f32> {
    let w = 10.0 / 3.0;
    let norm = 1.0 / (2.0 * sigma_size as f32 * (w + 2.0));
    let size = (3 + 2 * (sigma_size - 1)) as usize;
    let mut kernel = vec![0.0; size];
    if main {
        kernel[0] = -1.0;
        kernel[size - 1] = 1.0;
    } else {
        kernel[0] = norm;
        kernel[size / 2] = norm * w;
        kernel[size - 1] = norm;
    }
    kernel
}

pub fn scharr_horizontal(image: &GrayF32, sigma_size: u32) -> GrayF32 {
    if sigma_size <= 1 {
        return preprocessing::separable_filter(image, &[-1.0, 0.0, 1.0], &[3.0, 10.0, 3.0]);
    }
    preprocessing::separable_filter(image, &scharr_kernel(sigma_size, true), &scharr_kernel(sigma_size, false))
}

pub fn scharr_vertical(image: &GrayF32, sigma_size: u32) -> GrayF32 {
    if sigma_size <= 1 {
        return preprocessing::separable_filter(image, &[3.0, 10.0, 3.0], &[-1.0, 0.0, 1.0]);
    }
    preprocessing::separable_filter(image, &scharr_kernel(sigma_size, false), &scharr_kernel(sigma_size, true))
}

/// Dominant gradient direction in a π/3 sliding window
fn main_orientation(kp: &NonlinearKeypoint, evolutions: &[Evolution]) -> f32 {
    let e = &evolutions[kp.level];
    let ratio = e.ratio();
    let s = (0.5 * kp.size / ratio).round();
    let xf = kp.x / ratio;
    let yf = kp.y / ratio;
    let (w, h) = (e.lx.width() as i32, e.lx.height() as i32);

    let mut samples: Vec<(f32, f32, f32)> = Vec::with_capacity(109);
    for i in -6i32..=6 {
        for j in -6i32..=6 {
            if i * i + j * j >= 36 {
                continue;
            }
            let ix = ((xf + i as f32 * s).round() as i32).clamp(0, w - 1) as usize;
            let iy = ((yf + j as f32 * s).round() as i32).clamp(0, h - 1) as usize;
            let weight = (-((i * i + j * j) as f32) / (2.0 * 2.5 * 2.5)).exp();
            let rx = weight * e.lx.as_raw()[iy * w as usize + ix];
            let ry = weight * e.ly.as_raw()[iy * w as usize + ix];
            let mut ang = ry.atan2(rx);
            if ang < 0.0 {
                ang += 2.0 * PI;
            }
            samples.push((rx, ry, ang));
        }
    }

    let mut best = 0.0f32;
    let mut angle = 0.0f32;
    let mut ang1 = 0.0f32;
    while ang1 < 2.0 * PI {
        let ang2 = if ang1 + PI / 3.0 > 2.0 * PI { ang1 - 5.0 * PI / 3.0 } else { ang1 + PI / 3.0 };
        let (mut sx, mut sy) = (0.0f32, 0.0f32);
        for &(rx, ry, ang) in &samples {
            let inside = if ang1 < ang2 {
                ang1 < ang && ang < ang2
            } else {
                ang < ang2 || ang > ang1
            };
            if inside {
                sx += rx;
                sy += ry;
            }
        }
        let val = sx * sx + sy * sy;
        if val > best {
            best = val;
            angle = sy.atan2(sx);
        }
        ang1 += 0.15;
    }
    if angle < 0.0 {
        angle += 2.0 * PI;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    #[test]
    fn test_fed_steps_cover_time() {
        let steps = fed_tau_by_process_time(2.0, 0.25);
        assert!(!steps.is_empty());
        let total: f32 = steps.iter().sum();
        assert!((total - 2.0).abs() < 1e-3, "total {}", total);
        assert!(fed_tau_by_process_time(0.0, 0.25).is_empty());
    }

    #[test]
    fn test_conductivity_is_one_on_flat_regions() {
        let zero = GrayF32::new(4, 4);
        let g = pm_g2(&zero, &zero, 0.05);
        assert!(g.as_raw().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_small_images_have_no_evolutions() {
        let img = ImageBuffer::from_pixel(32, 32, Luma([50u8]));
        let mut space = NonlinearScaleSpace::build(&img, NonlinearOptions::new(0.001, 4, 4));
        assert!(space.evolutions.is_empty());
        assert!(space.detect(false).is_empty());
    }

    #[test]
    fn test_evolution_levels_per_octave() {
        let evolutions = allocate_evolutions(200, 100, &NonlinearOptions::new(0.001, 4, 4));
        // octave 0: 4 sublevels, octave 1 (50 px): 1 sublevel, octave 2 (25 px): none
        assert_eq!(evolutions.len(), 5);
        assert!(evolutions.windows(2).all(|w| w[1].esigma > w[0].esigma));
    }
}
