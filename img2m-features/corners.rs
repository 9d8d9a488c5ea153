//! Segment-test corner detection (FAST and the AGAST/OAST masks), corner
//! scores, non-maximum suppression, Harris responses and intensity-centroid
//! orientation.

use crate::config::AgastType;
use image::GrayImage;
use rayon::prelude::*;

/// Corner candidate with its segment-test score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCorner {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

/// Circle of pixels and the contiguous arc length a corner needs
#[derive(Debug, Clone, Copy)]
pub struct SegmentPattern {
    pub offsets: &'static [(i32, i32)],
    pub arc: usize,
}

impl SegmentPattern {
    /// Bresenham circle of radius 3, 9 contiguous pixels
    pub const FAST_9_16: SegmentPattern = SegmentPattern { offsets: &CIRCLE_16, arc: 9 };

    pub fn for_agast(agast_type: AgastType) -> Self {
        match agast_type {
            AgastType::Agast5_8 => SegmentPattern { offsets: &RING_8, arc: 5 },
            AgastType::Agast7_12d => SegmentPattern { offsets: &DIAMOND_12, arc: 7 },
            AgastType::Agast7_12s => SegmentPattern { offsets: &SQUARE_12, arc: 7 },
            AgastType::Oast9_16 => SegmentPattern { offsets: &OAST_16, arc: 9 },
        }
    }

    /// Distance from the border a pixel needs for the whole circle to fit
    pub fn border(&self) -> u32 {
        self.offsets
            .iter()
            .map(|&(dx, dy)| dx.unsigned_abs().max(dy.unsigned_abs()))
            .max()
            .unwrap_or(0)
    }
}

const CIRCLE_16: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

const OAST_16: [(i32, i32); 16] = [
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
];

const DIAMOND_12: [(i32, i32); 12] = [
    (-3, 0), (-2, -1), (-1, -2), (0, -3), (1, -2), (2, -1),
    (3, 0), (2, 1), (1, 2), (0, 3), (-1, 2), (-2, 1),
];

const SQUARE_12: [(i32, i32); 12] = [
    (-2, 0), (-2, -1), (-1, -2), (0, -2), (1, -2), (2, -1),
    (2, 0), (2, 1), (1, 2), (0, 2), (-1, 2), (-2, 1),
];

const RING_8: [(i32, i32); 8] = [(-1, 0), (-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1)];

/// True when `arc` contiguous circle pixels (wrapping) are all brighter than
/// `center + threshold` or all darker than `center - threshold`
#[inline]
fn passes_segment_test(ring: &[i16], center: i16, threshold: i16, arc: usize) -> bool {
    let n = ring.len();
    let mut bright = 0;
    let mut dark = 0;
    for k in 0..n + arc - 1 {
        let v = ring[k % n];
        if v > center + threshold {
            bright += 1;
            dark = 0;
        } else if v < center - threshold {
            dark += 1;
            bright = 0;
        } else {
            bright = 0;
            dark = 0;
        }
        if bright >= arc || dark >= arc {
            return true;
        }
    }
    false
}

/// Largest threshold at which the pixel still passes the segment test
fn corner_score(ring: &[i16], center: i16, threshold: i16, arc: usize) -> i16 {
    let (mut lo, mut hi) = (threshold, 255i16);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if passes_segment_test(ring, center, mid, arc) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// Segment-test corners of `img`, optionally 3x3 non-maximum suppressed
pub fn detect_corners(img: &GrayImage, threshold: u8, pattern: SegmentPattern, nonmax: bool) -> Vec<ScoredCorner> {
    let (w, h) = img.dimensions();
    let border = pattern.border();
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }
    let data = img.as_raw();
    let stride = w as usize;
    let threshold = i16::from(threshold);

    let mut scores = vec![0i16; (w * h) as usize];
    scores
        .par_chunks_mut(stride)
        .enumerate()
        .skip(border as usize)
        .take((h - 2 * border) as usize)
        .for_each(|(y, row)| {
            let mut ring = [0i16; 16];
            for x in border as usize..(w - border) as usize {
                let center = i16::from(data[y * stride + x]);
                for (k, &(dx, dy)) in pattern.offsets.iter().enumerate() {
                    let px = (x as i32 + dx) as usize;
                    let py = (y as i32 + dy) as usize;
                    ring[k] = i16::from(data[py * stride + px]);
                }
                let ring = &ring[..pattern.offsets.len()];
                if passes_segment_test(ring, center, threshold, pattern.arc) {
                    row[x] = corner_score(ring, center, threshold, pattern.arc);
                }
            }
        });

    let mut corners = Vec::new();
    for y in border..h - border {
        for x in border..w - border {
            let i = (y * w + x) as usize;
            let s = scores[i];
            if s == 0 {
                continue;
            }
            if nonmax {
                let is_max = (-1i32..=1).all(|dy| {
                    (-1i32..=1).all(|dx| {
                        if dx == 0 && dy == 0 {
                            return true;
                        }
                        let j = ((y as i32 + dy) as u32 * w + (x as i32 + dx) as u32) as usize;
                        // plateaus keep their first pixel in raster order
                        if dy < 0 || (dy == 0 && dx < 0) {
                            s > scores[j]
                        } else {
                            s >= scores[j]
                        }
                    })
                });
                if !is_max {
                    continue;
                }
            }
            corners.push(ScoredCorner { x, y, score: f32::from(s) });
        }
    }
    corners
}

/// Segment-test score of a single pixel, 0 when it is not a corner or the
/// circle leaves the image
pub fn pixel_score(img: &GrayImage, x: i64, y: i64, threshold: u8, pattern: SegmentPattern) -> f32 {
    let (w, h) = img.dimensions();
    let border = i64::from(pattern.border());
    if x < border || y < border || x + border >= i64::from(w) || y + border >= i64::from(h) {
        return 0.0;
    }
    let center = i16::from(img.get_pixel(x as u32, y as u32)[0]);
    let mut ring = [0i16; 16];
    for (k, &(dx, dy)) in pattern.offsets.iter().enumerate() {
        ring[k] = i16::from(img.get_pixel((x + i64::from(dx)) as u32, (y + i64::from(dy)) as u32)[0]);
    }
    let ring = &ring[..pattern.offsets.len()];
    let threshold = i16::from(threshold);
    if passes_segment_test(ring, center, threshold, pattern.arc) {
        f32::from(corner_score(ring, center, threshold, pattern.arc))
    } else {
        0.0
    }
}

/// Harris corner measure over a `block`x`block` window of Sobel gradients
pub fn harris_response(img: &GrayImage, x: u32, y: u32, block: u32) -> f32 {
    let (w, h) = img.dimensions();
    let r = block / 2 + 1;
    if x < r || y < r || x + r >= w || y + r >= h {
        return 0.0;
    }
    let stride = w as usize;
    let data = img.as_raw();
    let p = |xx: u32, yy: u32| f32::from(data[yy as usize * stride + xx as usize]);

    let (mut a, mut b, mut c) = (0.0f32, 0.0f32, 0.0f32);
    let half = (block / 2) as i32;
    for dy in -half..=half {
        for dx in -half..=half {
            let xx = (x as i32 + dx) as u32;
            let yy = (y as i32 + dy) as u32;
            let gx = (p(xx + 1, yy - 1) + 2.0 * p(xx + 1, yy) + p(xx + 1, yy + 1))
                - (p(xx - 1, yy - 1) + 2.0 * p(xx - 1, yy) + p(xx - 1, yy + 1));
            let gy = (p(xx - 1, yy + 1) + 2.0 * p(xx, yy + 1) + p(xx + 1, yy + 1))
                - (p(xx - 1, yy - 1) + 2.0 * p(xx, yy - 1) + p(xx + 1, yy - 1));
            a += gx * gx;
            b += gy * gy;
            c += gx * gy;
        }
    }
    let scale = 1.0 / ((4 * block) as f32 * 255.0);
    let scale4 = scale.powi(4);
    (a * b - c * c - 0.04 * (a + b) * (a + b)) * scale4
}

/// Intensity-centroid orientation in degrees, `[0, 360)`
pub fn intensity_centroid_angle(img: &GrayImage, x: f32, y: f32, radius: i32) -> f32 {
    let (w, h) = img.dimensions();
    let cx = x.round() as i32;
    let cy = y.round() as i32;
    let (mut m01, mut m10) = (0.0f64, 0.0f64);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let px = (cx + dx).clamp(0, w as i32 - 1) as u32;
            let py = (cy + dy).clamp(0, h as i32 - 1) as u32;
            let v = f64::from(img.get_pixel(px, py)[0]);
            m10 += f64::from(dx) * v;
            m01 += f64::from(dy) * v;
        }
    }
    if m10 == 0.0 && m01 == 0.0 {
        return 0.0;
    }
    let mut angle = (m01.atan2(m10) as f32).to_degrees();
    if angle < 0.0 {
        angle += 360.0;
    }
    if angle >= 360.0 {
        angle -= 360.0;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    /// Bright square on a dark background, corners at (10,10), (29,10), ...
    fn create_square_image() -> GrayImage {
        ImageBuffer::from_fn(40, 40, |x, y| {
            Luma([if (10..30).contains(&x) && (10..30).contains(&y) { 200u8 } else { 20 }])
        })
    }

    #[test]
    fn test_uniform_image_has_no_corners() {
        let img = ImageBuffer::from_pixel(32, 32, Luma([77u8]));
        assert!(detect_corners(&img, 10, SegmentPattern::FAST_9_16, true).is_empty());
    }

    #[test]
    fn test_square_corners_found() {
        let img = create_square_image();
        let corners = detect_corners(&img, 20, SegmentPattern::FAST_9_16, true);
        assert!(!corners.is_empty());
        assert!(corners.iter().any(|c| c.x.abs_diff(10) <= 2 && c.y.abs_diff(10) <= 2));
        // edges midway along a side are not corners
        assert!(!corners.iter().any(|c| c.x == 20 && c.y == 10));
    }

    #[test]
    fn test_nonmax_reduces_candidates() {
        let img = create_square_image();
        let all = detect_corners(&img, 20, SegmentPattern::FAST_9_16, false);
        let suppressed = detect_corners(&img, 20, SegmentPattern::FAST_9_16, true);
        assert!(suppressed.len() <= all.len());
    }

    #[test]
    fn test_agast_masks() {
        let img = create_square_image();
        for t in [AgastType::Agast5_8, AgastType::Agast7_12d, AgastType::Agast7_12s, AgastType::Oast9_16] {
            let pattern = SegmentPattern::for_agast(t);
            assert!(!detect_corners(&img, 20, pattern, true).is_empty(), "{}", t.name());
        }
        assert_eq!(SegmentPattern::for_agast(AgastType::Agast5_8).border(), 1);
        assert_eq!(SegmentPattern::for_agast(AgastType::Agast7_12s).border(), 2);
    }

    #[test]
    fn test_pixel_score_agrees_with_detection() {
        let img = create_square_image();
        for c in detect_corners(&img, 20, SegmentPattern::FAST_9_16, false) {
            let s = pixel_score(&img, i64::from(c.x), i64::from(c.y), 20, SegmentPattern::FAST_9_16);
            assert_eq!(s, c.score);
        }
        assert_eq!(pixel_score(&img, 1, 1, 20, SegmentPattern::FAST_9_16), 0.0);
    }

    #[test]
    fn test_score_is_at_least_threshold() {
        let ring = [100i16; 16];
        assert!(passes_segment_test(&ring, 10, 20, 9));
        assert_eq!(corner_score(&ring, 10, 20, 9), 89);
    }

    #[test]
    fn test_centroid_points_towards_bright_side() {
        let img = ImageBuffer::from_fn(40, 40, |x, _| Luma([if x > 20 { 255u8 } else { 0 }]));
        let angle = intensity_centroid_angle(&img, 20.0, 20.0, 15);
        assert!(angle < 1.0 || angle > 359.0, "angle {}", angle);
    }
}
