use crate::error::{FeatureError, FeatureResult};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use img2m_core::Keypoint;

/// Single-channel float image
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Smallest side a kernel will accept
pub const MIN_IMAGE_SIZE: u32 = 16;

/// Reject empty or tiny images before running a kernel
pub fn validate_image(img: &GrayImage) -> FeatureResult<()> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(FeatureError::InvalidImageSize { width, height });
    }
    if width < MIN_IMAGE_SIZE || height < MIN_IMAGE_SIZE {
        return Err(FeatureError::ImageTooSmall { width, height, min_size: MIN_IMAGE_SIZE });
    }
    Ok(())
}

/// Convert to float with values in [0, 1]
pub fn to_unit_float(img: &GrayImage) -> GrayF32 {
    ImageBuffer::from_fn(img.width(), img.height(), |x, y| Luma([f32::from(img.get_pixel(x, y)[0]) / 255.0]))
}

/// Gaussian blur, identity for non-positive sigma
pub fn blur(img: &GrayF32, sigma: f32) -> GrayF32 {
    if sigma <= 0.0 {
        return img.clone();
    }
    gaussian_blur_f32(img, sigma)
}

pub fn resize(img: &GrayF32, width: u32, height: u32, filter: FilterType) -> GrayF32 {
    imageops::resize(img, width, height, filter)
}

/// Every other pixel in both directions
pub fn downsample_nearest(img: &GrayF32) -> GrayF32 {
    let width = (img.width() / 2).max(1);
    let height = (img.height() / 2).max(1);
    ImageBuffer::from_fn(width, height, |x, y| *img.get_pixel(2 * x, 2 * y))
}

/// Half-size image by 2x2 box averaging, odd borders averaged over what exists
pub fn half_size(img: &GrayF32) -> GrayF32 {
    let (w, h) = img.dimensions();
    let width = (w / 2).max(1);
    let height = (h / 2).max(1);
    ImageBuffer::from_fn(width, height, |x, y| {
        let mut sum = 0.0;
        let mut count = 0.0;
        for dy in 0..2 {
            for dx in 0..2 {
                let sx = 2 * x + dx;
                let sy = 2 * y + dy;
                if sx < w && sy < h {
                    sum += img.get_pixel(sx, sy)[0];
                    count += 1.0;
                }
            }
        }
        Luma([sum / count])
    })
}

/// Correlate rows with `h_kernel`, then columns with `v_kernel`, replicating borders
pub fn separable_filter(img: &GrayF32, h_kernel: &[f32], v_kernel: &[f32]) -> GrayF32 {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let src = img.as_raw();
    let hh = (h_kernel.len() / 2) as isize;
    let vh = (v_kernel.len() / 2) as isize;

    let mut tmp = vec![0.0f32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            tmp[y * w + x] = h_kernel
                .iter()
                .enumerate()
                .map(|(k, kv)| kv * row[(x as isize + k as isize - hh).clamp(0, w as isize - 1) as usize])
                .sum();
        }
    }

    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            out[y * w + x] = v_kernel
                .iter()
                .enumerate()
                .map(|(k, kv)| kv * tmp[(y as isize + k as isize - vh).clamp(0, h as isize - 1) as usize * w + x])
                .sum();
        }
    }
    GrayF32::from_raw(img.width(), img.height(), out).unwrap_or_else(|| GrayF32::new(img.width(), img.height()))
}

/// Normalized Gaussian kernel of odd length
pub fn gaussian_kernel(sigma: f32, size: usize) -> Vec<f32> {
    let half = (size / 2) as i32;
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in kernel.iter_mut() {
        *v /= sum;
    }
    kernel
}

/// Summed-area table of an 8-bit image
pub struct IntegralImage {
    width: i64,
    height: i64,
    /// `(width + 1) * (height + 1)` sums, first row and column zero
    data: Vec<f64>,
}

impl IntegralImage {
    pub fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let mut data = vec![0.0f64; (w + 1) * (h + 1)];
        let src = img.as_raw();
        for y in 0..h {
            let mut row_sum = 0.0;
            for x in 0..w {
                row_sum += f64::from(src[y * w + x]);
                data[(y + 1) * (w + 1) + x + 1] = data[y * (w + 1) + x + 1] + row_sum;
            }
        }
        Self { width: w as i64, height: h as i64, data }
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    /// Sum over `[x0, x1) x [y0, y1)`, clipped to the image
    pub fn box_sum(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> f64 {
        let x0 = x0.clamp(0, self.width);
        let x1 = x1.clamp(0, self.width);
        let y0 = y0.clamp(0, self.height);
        let y1 = y1.clamp(0, self.height);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let stride = self.width + 1;
        let at = |x: i64, y: i64| self.data[(y * stride + x) as usize];
        at(x1, y1) - at(x0, y1) - at(x1, y0) + at(x0, y0)
    }

    /// Mean over the clipped box, 0 when the box misses the image
    pub fn box_mean(&self, x0: i64, y0: i64, x1: i64, y1: i64) -> f64 {
        let area = (x1.clamp(0, self.width) - x0.clamp(0, self.width)) * (y1.clamp(0, self.height) - y0.clamp(0, self.height));
        if area <= 0 {
            return 0.0;
        }
        self.box_sum(x0, y0, x1, y1) / area as f64
    }
}

/// Pixel value with coordinates clamped to the border
#[inline]
pub fn pixel(img: &GrayF32, x: i32, y: i32) -> f32 {
    let x = x.clamp(0, img.width() as i32 - 1) as u32;
    let y = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(x, y)[0]
}

/// Sample image at fractional coordinates using bilinear interpolation
pub fn bilinear(img: &GrayF32, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i32, y0 as i32);

    let p00 = pixel(img, x0, y0);
    let p10 = pixel(img, x0 + 1, y0);
    let p01 = pixel(img, x0, y0 + 1);
    let p11 = pixel(img, x0 + 1, y0 + 1);

    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Scale factor applied to the input image for a SIFT `first_octave`
pub fn octave_scale(first_octave: i32) -> FeatureResult<f32> {
    match first_octave {
        -1 => Ok(2.0),
        0 => Ok(1.0),
        1 => Ok(0.5),
        other => Err(FeatureError::InvalidFirstOctave(other)),
    }
}

/// Rescale the input for `first_octave`: bicubic 2x upscale for -1,
/// 2x2 area average for 1, untouched for 0
pub fn apply_first_octave(img: &GrayImage, first_octave: i32) -> FeatureResult<(GrayImage, f32)> {
    let scale = octave_scale(first_octave)?;
    let resized = match first_octave {
        -1 => imageops::resize(img, img.width() * 2, img.height() * 2, FilterType::CatmullRom),
        1 => {
            let (w, h) = img.dimensions();
            let (width, height) = ((w / 2).max(1), (h / 2).max(1));
            ImageBuffer::from_fn(width, height, |x, y| {
                let sum: u32 = [(0, 0), (1, 0), (0, 1), (1, 1)]
                    .iter()
                    .map(|&(dx, dy)| u32::from(img.get_pixel((2 * x + dx).min(w - 1), (2 * y + dy).min(h - 1))[0]))
                    .sum();
                Luma([((sum + 2) / 4) as u8])
            })
        }
        _ => img.clone(),
    };
    Ok((resized, scale))
}

/// Map keypoints detected on the rescaled image back to the input frame
pub fn restore_keypoints(keypoints: &mut [Keypoint], scale: f32) {
    if scale == 1.0 {
        return;
    }
    let inv = 1.0 / scale;
    for kp in keypoints.iter_mut() {
        *kp = kp.scaled(inv);
    }
}

/// Map input-frame keypoints into the rescaled image frame
pub fn to_scaled_frame(keypoints: &[Keypoint], scale: f32) -> Vec<Keypoint> {
    keypoints.iter().map(|kp| kp.scaled(scale)).collect()
}
