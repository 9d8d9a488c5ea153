//! Feature extraction over every view of a run.
//!
//! Extraction is two-phase: the per-view outputs are written into slots
//! pre-sized to the number of views (one slot per `view_id`, no locking),
//! then the non-empty views are re-emitted in `view_id` order for matching.

use crate::error::{PipelineError, PipelineResult};
use image::{GrayImage, RgbImage};
use img2m_core::{
    assign_view_ids, DescriptorMatrix, FeatureRecord, Features, ImageRecord, Keypoint, ProgressTracker, ViewEntry,
};
use img2m_features::FeatureExtractor;
use img2m_matching::ViewData;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::PathBuf;

/// Estimated memory held by one cached grayscale image
const CACHED_IMAGE_MB: usize = 2;

/// Keypoints, descriptors and optionally the grayscale image of one view
#[derive(Debug, Clone)]
pub struct ExtractedView {
    pub view_id: u32,
    pub path: PathBuf,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: DescriptorMatrix,
    pub image: Option<GrayImage>,
}

impl ExtractedView {
    /// Image-level view for matchers that need pixels, `None` when not cached
    pub fn view_data(&self) -> Option<ViewData<'_>> {
        self.image.as_ref().map(|image| ViewData {
            image,
            keypoints: &self.keypoints,
            descriptors: &self.descriptors,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// One slot per view id; slots of unreadable images stay empty
    pub features: Features,
    /// Views with at least one keypoint, in view id order
    pub views: Vec<ExtractedView>,
}

#[derive(Debug)]
struct ViewOutput {
    keypoints: Vec<Keypoint>,
    descriptors: DescriptorMatrix,
    image: Option<GrayImage>,
}

pub fn log_cache_decision(cache_images: bool, num_views: usize) {
    if cache_images {
        info!("Caching {} grayscale images for image-level matching", num_views);
    } else {
        info!(
            "Matcher works on descriptors only, disabling image caching (saves about {} MB)",
            num_views * CACHED_IMAGE_MB
        );
    }
}

/// Detect and describe every valid image.
///
/// Unreadable images and kernel failures are logged and leave their slot
/// empty. Fails only when no image is valid at all.
pub fn extract_views(
    records: &[ImageRecord],
    extractor: &FeatureExtractor,
    pool: &ThreadPool,
    cache_images: bool,
) -> PipelineResult<Extraction> {
    let entries = assign_view_ids(records);
    if entries.is_empty() {
        return Err(PipelineError::InputData(format!(
            "no valid image among {} records",
            records.len()
        )));
    }

    let num_views = entries.len();
    info!("Extracting {} features from {} views", extractor.detector_type(), num_views);
    log_cache_decision(cache_images, num_views);

    let progress = ProgressTracker::new("Feature extraction", num_views);
    let mut features = Features::with_len(num_views);
    let mut outputs: Vec<Option<ViewOutput>> = (0..num_views).map(|_| None).collect();

    pool.install(|| {
        features
            .slots_mut()
            .par_iter_mut()
            .zip(outputs.par_iter_mut())
            .zip(entries.par_iter())
            .for_each(|((slot, output), entry)| {
                if let Some((record, view)) = extract_one(entry, extractor, cache_images) {
                    *slot = record;
                    *output = Some(view);
                }
                progress.advance();
            });
    });

    let views = collect_views(&entries, outputs);
    info!(
        "Extracted {} keypoints, {} of {} views usable for matching",
        features.total_keypoints(),
        views.len(),
        num_views
    );
    Ok(Extraction { features, views })
}

/// Recompute descriptors on the keypoints of an existing collection
/// without detecting again. Views the kernel cannot describe are skipped.
pub fn recompute_views(
    existing: &Features,
    extractor: &FeatureExtractor,
    pool: &ThreadPool,
    cache_images: bool,
) -> PipelineResult<Extraction> {
    if !existing.has_keypoints() {
        return Err(PipelineError::InputData("existing features carry no keypoints".to_string()));
    }
    if !extractor.supports_compute() {
        error!(
            "{} cannot describe existing keypoints, every view will be skipped",
            extractor.detector_type()
        );
    }

    let num_views = existing.len();
    info!("Recomputing {} descriptors for {} existing views", extractor.detector_type(), num_views);
    log_cache_decision(cache_images, num_views);

    let entries: Vec<ViewEntry> = existing
        .iter()
        .map(|(view_id, record)| ViewEntry {
            view_id: view_id as u32,
            path: PathBuf::from(&record.image_path),
        })
        .collect();

    let progress = ProgressTracker::new("Descriptor recomputation", num_views);
    let outputs: Vec<Option<ViewOutput>> = pool.install(|| {
        entries
            .par_iter()
            .map(|entry| {
                let output = existing
                    .get(entry.view_id as usize)
                    .and_then(|record| recompute_one(entry, record, extractor, cache_images));
                progress.advance();
                output
            })
            .collect()
    });

    let views = collect_views(&entries, outputs);
    info!("Recomputed descriptors for {} of {} views", views.len(), num_views);
    Ok(Extraction {
        features: existing.clone(),
        views,
    })
}

fn extract_one(entry: &ViewEntry, extractor: &FeatureExtractor, cache_image: bool) -> Option<(FeatureRecord, ViewOutput)> {
    let decoded = match image::open(&entry.path) {
        Ok(img) => img,
        Err(e) => {
            error!("Cannot read image {} ({}), skipping view {}", entry.path.display(), e, entry.view_id);
            return None;
        }
    };
    let gray = decoded.to_luma8();

    let (keypoints, descriptors) = match extractor.extract(&gray) {
        Ok(result) => result,
        Err(e) => {
            error!("Feature extraction failed for view {}: {}", entry.view_id, e);
            return None;
        }
    };
    let colors = sample_colors(&decoded.to_rgb8(), &keypoints);
    debug!("View {}: {} keypoints", entry.view_id, keypoints.len());

    let record = FeatureRecord::new(entry.path.display().to_string(), keypoints.clone(), Some(colors));
    let output = ViewOutput {
        keypoints,
        descriptors,
        image: cache_image.then_some(gray),
    };
    Some((record, output))
}

fn recompute_one(
    entry: &ViewEntry,
    record: &FeatureRecord,
    extractor: &FeatureExtractor,
    cache_image: bool,
) -> Option<ViewOutput> {
    if record.keypoints.is_empty() {
        return None;
    }
    let gray = match image::open(&entry.path) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            error!("Cannot read image {} ({}), skipping view {}", entry.path.display(), e, entry.view_id);
            return None;
        }
    };
    let descriptors = match extractor.compute(&gray, &record.keypoints) {
        Ok(d) if d.rows() == record.keypoints.len() => d,
        Ok(d) => {
            error!(
                "View {}: {} descriptors for {} keypoints, skipping",
                entry.view_id,
                d.rows(),
                record.keypoints.len()
            );
            return None;
        }
        Err(e) => {
            error!("Descriptor recomputation failed for view {}: {}", entry.view_id, e);
            return None;
        }
    };
    Some(ViewOutput {
        keypoints: record.keypoints.clone(),
        descriptors,
        image: cache_image.then_some(gray),
    })
}

fn collect_views(entries: &[ViewEntry], outputs: Vec<Option<ViewOutput>>) -> Vec<ExtractedView> {
    entries
        .iter()
        .zip(outputs)
        .filter_map(|(entry, output)| {
            let output = output?;
            if output.keypoints.is_empty() {
                warn!("View {} has no features, excluded from matching", entry.view_id);
                return None;
            }
            Some(ExtractedView {
                view_id: entry.view_id,
                path: entry.path.clone(),
                keypoints: output.keypoints,
                descriptors: output.descriptors,
                image: output.image,
            })
        })
        .collect()
}

/// RGB at the rounded keypoint position, black outside the image
pub fn sample_colors(rgb: &RgbImage, keypoints: &[Keypoint]) -> Vec<[u8; 3]> {
    keypoints
        .iter()
        .map(|kp| {
            let (x, y) = (kp.x.round(), kp.y.round());
            if x >= 0.0 && y >= 0.0 && (x as u32) < rgb.width() && (y as u32) < rgb.height() {
                rgb.get_pixel(x as u32, y as u32).0
            } else {
                [0, 0, 0]
            }
        })
        .collect()
}
