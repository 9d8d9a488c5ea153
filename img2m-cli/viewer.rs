//! Interactive tuning of one view pair before the full run.
//!
//! The pipeline hands a [`MatchPreview`] to a [`ViewerFrontend`] and acts
//! on the returned [`ViewerAction`] until the front-end applies the
//! parameters to all views or cancels.

use image::{DynamicImage, GrayImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_antialiased_line_segment_mut, draw_hollow_circle_mut};
use imageproc::pixelops::interpolate;
use img2m_core::{Keypoint, Match};
use log::{info, warn};
use std::path::{Path, PathBuf};

const LINE_COLOR: Rgba<u8> = Rgba([255, 255, 0, 255]);
const KEYPOINT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// One side of the previewed pair
#[derive(Debug, Clone)]
pub struct PreviewView {
    pub view_id: u32,
    pub path: PathBuf,
    pub image: GrayImage,
    pub keypoints: Vec<Keypoint>,
}

#[derive(Debug, Clone)]
pub struct MatchPreview {
    pub query: PreviewView,
    pub train: PreviewView,
    pub matches: Vec<Match>,
    pub ratio_thresh: f32,
    /// 0 draws opaque lines, 1 hides them
    pub line_transparency: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewerAction {
    /// Match the pair again under a new ratio threshold
    Rematch { ratio_thresh: f32 },
    SetTransparency(f32),
    /// Run every pair with the current parameters
    ApplyToAll,
    Cancel,
}

/// Source of viewer decisions.
///
/// The pipeline asks for actions until one of them is
/// [`ViewerAction::ApplyToAll`] or [`ViewerAction::Cancel`]. A `Rematch`
/// outside `(0, 1)` is ignored, and [`MAX_REJECTED_RATIOS`] of them in a
/// row cancel the viewer.
///
/// [`MAX_REJECTED_RATIOS`]: crate::MAX_REJECTED_RATIOS
pub trait ViewerFrontend {
    /// Show `preview` and return the next user decision
    fn next_action(&mut self, preview: &MatchPreview) -> ViewerAction;
}

/// Side-by-side rendering with matches drawn as blended lines
pub fn render_preview(preview: &MatchPreview) -> RgbaImage {
    let left = DynamicImage::ImageLuma8(preview.query.image.clone()).into_rgba8();
    let right = DynamicImage::ImageLuma8(preview.train.image.clone()).into_rgba8();
    let offset = left.width();
    let mut canvas = RgbaImage::from_pixel(
        left.width() + right.width(),
        left.height().max(right.height()),
        Rgba([0, 0, 0, 255]),
    );
    image::imageops::replace(&mut canvas, &left, 0, 0);
    image::imageops::replace(&mut canvas, &right, i64::from(offset), 0);

    let opacity = (1.0 - preview.line_transparency).clamp(0.0, 1.0);
    for m in &preview.matches {
        let (Some(a), Some(b)) = (preview.query.keypoints.get(m.query_idx), preview.train.keypoints.get(m.train_idx)) else {
            continue;
        };
        let start = (a.x.round() as i32, a.y.round() as i32);
        let end = (b.x.round() as i32 + offset as i32, b.y.round() as i32);
        draw_hollow_circle_mut(&mut canvas, start, 3, KEYPOINT_COLOR);
        draw_hollow_circle_mut(&mut canvas, end, 3, KEYPOINT_COLOR);
        if opacity > 0.0 {
            draw_antialiased_line_segment_mut(&mut canvas, start, end, LINE_COLOR, |line, background, weight| {
                interpolate(line, background, weight * opacity)
            });
        }
    }
    canvas
}

/// Front-end without a display: writes the first preview to a PNG and
/// applies the configured parameters to all views.
pub struct HeadlessFrontend {
    output: PathBuf,
    rendered: bool,
}

impl HeadlessFrontend {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            rendered: false,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    fn save(&self, preview: &MatchPreview) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = self.output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        render_preview(preview).save(&self.output)?;
        Ok(())
    }
}

impl ViewerFrontend for HeadlessFrontend {
    fn next_action(&mut self, preview: &MatchPreview) -> ViewerAction {
        if !self.rendered {
            self.rendered = true;
            match self.save(preview) {
                Ok(()) => info!(
                    "Preview of pair ({}, {}) with {} matches written to {}",
                    preview.query.view_id,
                    preview.train.view_id,
                    preview.matches.len(),
                    self.output.display()
                ),
                Err(e) => warn!("Cannot write preview {}: {}", self.output.display(), e),
            }
        }
        ViewerAction::ApplyToAll
    }
}
