//! Image-to-matches pipeline.
//!
//! [`Img2MatchesPipeline`] extracts features from every valid image, matches
//! every view pair and optionally exports both collections as JSON. The
//! viewer mode previews a single pair through a [`ViewerFrontend`] first.

pub mod error;
pub mod export;
pub mod extraction;
pub mod options;
pub mod pairwise;
pub mod viewer;

pub use error::{PipelineError, PipelineResult};
pub use export::{export_features, export_matches, load_features, load_matches};
pub use extraction::{ExtractedView, Extraction};
pub use options::{ConfigDocument, ExportOptions, PipelineOptions, RunMode, ViewerOptions};
pub use pairwise::{pair_seed, PairwiseEngine, PairwiseOutcome};
pub use viewer::{HeadlessFrontend, MatchPreview, PreviewView, ViewerAction, ViewerFrontend};

use img2m_core::{assign_view_ids, build_thread_pool, collect_image_records, Features, ImageRecord, Matches, ViewEntry};
use img2m_features::FeatureExtractor;
use img2m_matching::{MatcherConfig, MatcherDispatcher};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Consecutive out-of-range re-match requests after which the viewer cancels
pub const MAX_REJECTED_RATIOS: usize = 3;

/// Output of a successful run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultBundle {
    pub features: Features,
    pub matches: Matches,
}

pub struct Img2MatchesPipeline {
    options: PipelineOptions,
    images: Vec<ImageRecord>,
    existing_features: Option<Features>,
}

impl Img2MatchesPipeline {
    pub fn new(options: PipelineOptions, images: Vec<ImageRecord>) -> Self {
        Self {
            options,
            images,
            existing_features: None,
        }
    }

    /// Pipeline over every image file of `dir`
    pub fn from_image_dir<P: AsRef<Path>>(options: PipelineOptions, dir: P) -> PipelineResult<Self> {
        Ok(Self::new(options, collect_image_records(dir)?))
    }

    /// Reuse these keypoints instead of detecting; only descriptors are
    /// recomputed
    pub fn with_features(mut self, features: Features) -> Self {
        self.existing_features = Some(features);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut PipelineOptions {
        &mut self.options
    }

    /// Validate and run the configured mode. The viewer mode uses the
    /// headless front-end.
    pub fn run(&mut self) -> PipelineResult<ResultBundle> {
        self.options.validate()?;
        match self.options.run_mode {
            RunMode::Fast => self.run_fast(),
            RunMode::Viewer => {
                let mut frontend = HeadlessFrontend::new(preview_path(&self.options));
                self.run_viewer(&mut frontend)
            }
        }
    }

    /// [`run`](Self::run) with errors logged and collapsed to `None`
    pub fn run_or_null(&mut self) -> Option<ResultBundle> {
        match self.run() {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                error!("Image-to-matches run failed: {}", e);
                None
            }
        }
    }

    /// Extract (or recompute) features, match all pairs and export
    pub fn run_fast(&mut self) -> PipelineResult<ResultBundle> {
        self.options.validate()?;
        let options = &self.options;
        debug!("{}", options.detector.summary());
        debug!("{}", options.matcher.summary());

        let pool = build_thread_pool(options.num_threads).map_err(|e| PipelineError::ThreadPool(e.to_string()))?;
        let extractor = FeatureExtractor::new(options.detector.clone())?;
        let dispatcher = MatcherDispatcher::new(options.matcher.clone(), extractor.detector_type())?;
        let cache_images = dispatcher.needs_images();

        let start = Instant::now();
        let extraction = match &self.existing_features {
            Some(features) if features.has_keypoints() => {
                info!("Reusing {} existing keypoints", features.total_keypoints());
                extraction::recompute_views(features, &extractor, &pool, cache_images)?
            }
            _ => extraction::extract_views(&self.images, &extractor, &pool, cache_images)?,
        };
        info!("Feature stage finished in {:.2?}", start.elapsed());

        let outcome = PairwiseEngine::new(&dispatcher, options.num_threads).match_all(&extraction.views, &pool);
        if outcome.matched_pairs == 0 {
            warn!("No view pair produced matches");
        }

        let bundle = ResultBundle {
            features: extraction.features,
            matches: outcome.matches,
        };
        self.export(&bundle)?;
        Ok(bundle)
    }

    /// Preview the configured view pair, let `frontend` tune it and run
    /// every pair once it applies the parameters
    pub fn run_viewer(&mut self, frontend: &mut dyn ViewerFrontend) -> PipelineResult<ResultBundle> {
        self.options.validate()?;
        let entries = assign_view_ids(&self.images);
        let (i, j) = (self.options.viewer.show_view_pair_i, self.options.viewer.show_view_pair_j);
        validate_view_pair(i, j, entries.len())?;
        info!("Viewer: previewing view pair ({}, {})", i, j);

        let extractor = FeatureExtractor::new(self.options.detector.clone())?;
        let query = load_view(&entries[i as usize], &extractor)?;
        let train = load_view(&entries[j as usize], &extractor)?;

        let mut config = self.options.matcher.clone();
        let matches = preview_matches(&config, &extractor, &query, &train)?;
        info!("Found {} matches", matches.len());
        let mut preview = MatchPreview {
            query: to_preview(&query),
            train: to_preview(&train),
            matches,
            ratio_thresh: config.ratio_thresh,
            line_transparency: self.options.viewer.line_transparency,
        };

        let mut rejected = 0;
        loop {
            match frontend.next_action(&preview) {
                ViewerAction::Rematch { ratio_thresh } => {
                    if !(ratio_thresh > 0.0 && ratio_thresh < 1.0) {
                        rejected += 1;
                        warn!("Ignoring ratio threshold {} (must be in (0, 1))", ratio_thresh);
                        if rejected >= MAX_REJECTED_RATIOS {
                            warn!("{} invalid ratio thresholds in a row, cancelling viewer", rejected);
                            return Err(PipelineError::ViewerCancelled);
                        }
                        continue;
                    }
                    rejected = 0;
                    config.ratio_thresh = ratio_thresh;
                    preview.matches = preview_matches(&config, &extractor, &query, &train)?;
                    preview.ratio_thresh = ratio_thresh;
                    info!("Ratio {}: {} matches", ratio_thresh, preview.matches.len());
                }
                ViewerAction::SetTransparency(t) => preview.line_transparency = t.clamp(0.0, 1.0),
                ViewerAction::ApplyToAll => {
                    info!("Applying ratio {} to all views", preview.ratio_thresh);
                    self.options.matcher.ratio_thresh = preview.ratio_thresh;
                    self.options.viewer.line_transparency = preview.line_transparency;
                    return self.run_fast();
                }
                ViewerAction::Cancel => {
                    info!("Viewer cancelled, nothing matched");
                    return Err(PipelineError::ViewerCancelled);
                }
            }
        }
    }

    fn export(&self, bundle: &ResultBundle) -> PipelineResult<()> {
        let export = &self.options.export;
        if export.export_features {
            export::export_features(&bundle.features, &export.export_fea_path)?;
        }
        if export.export_matches {
            export::export_matches(&bundle.matches, &export.export_match_path)?;
        }
        Ok(())
    }
}

fn validate_view_pair(i: u32, j: u32, num_views: usize) -> PipelineResult<()> {
    if i == j {
        return Err(PipelineError::config("show_view_pair_j", format!("{} (must differ from show_view_pair_i)", j)));
    }
    for (key, index) in [("show_view_pair_i", i), ("show_view_pair_j", j)] {
        if index as usize >= num_views {
            return Err(PipelineError::config(key, format!("{} (only {} valid views)", index, num_views)));
        }
    }
    Ok(())
}

fn load_view(entry: &ViewEntry, extractor: &FeatureExtractor) -> PipelineResult<ExtractedView> {
    let image = image::open(&entry.path)?.to_luma8();
    let (keypoints, descriptors) = extractor.extract(&image)?;
    info!("View {}: {} keypoints", entry.view_id, keypoints.len());
    Ok(ExtractedView {
        view_id: entry.view_id,
        path: entry.path.clone(),
        keypoints,
        descriptors,
        image: Some(image),
    })
}

fn preview_matches(
    config: &MatcherConfig,
    extractor: &FeatureExtractor,
    query: &ExtractedView,
    train: &ExtractedView,
) -> PipelineResult<Vec<img2m_core::Match>> {
    let dispatcher = MatcherDispatcher::new(config.clone(), extractor.detector_type())?;
    Ok(pairwise::match_views(&dispatcher, query, train)?)
}

fn to_preview(view: &ExtractedView) -> PreviewView {
    PreviewView {
        view_id: view.view_id,
        path: view.path.clone(),
        image: view.image.clone().unwrap_or_default(),
        keypoints: view.keypoints.clone(),
    }
}

/// Default location of the viewer preview for a configuration
pub fn preview_path(options: &PipelineOptions) -> PathBuf {
    options.export.export_match_path.join(format!(
        "viewer_pair_{}_{}.png",
        options.viewer.show_view_pair_i, options.viewer.show_view_pair_j
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{ImageBuffer, Rgb, RgbImage};
    use img2m_core::ImageRecord;
    use std::path::Path;

    const SCENE_SIZE: u32 = 200;
    const VIEW_SIZE: u32 = 160;

    struct Lcg(u32);

    impl Lcg {
        fn next(&mut self, bound: u32) -> u32 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (self.0 >> 8) % bound
        }
    }

    /// Grey value of a fixed scene of rectangles and blobs
    fn create_scene() -> Vec<f32> {
        let mut rng = Lcg(42);
        let rects: Vec<(u32, u32, u32, u32, f32)> = (0..70)
            .map(|_| {
                let (x, y) = (rng.next(SCENE_SIZE), rng.next(SCENE_SIZE));
                (x, y, 6 + rng.next(24), 6 + rng.next(24), rng.next(256) as f32)
            })
            .collect();
        let blobs: Vec<(f32, f32, f32, f32)> = (0..40)
            .map(|_| {
                let (x, y) = (rng.next(SCENE_SIZE) as f32, rng.next(SCENE_SIZE) as f32);
                (x, y, 2.0 + rng.next(5) as f32, rng.next(160) as f32 - 80.0)
            })
            .collect();

        let mut scene = vec![0.0f32; (SCENE_SIZE * SCENE_SIZE) as usize];
        for y in 0..SCENE_SIZE {
            for x in 0..SCENE_SIZE {
                let mut v = 90.0 + ((x * 3 + y * 2) % 40) as f32;
                for &(rx, ry, w, h, value) in &rects {
                    if (rx..rx + w).contains(&x) && (ry..ry + h).contains(&y) {
                        v = value;
                    }
                }
                for &(bx, by, r, amp) in &blobs {
                    let d2 = (x as f32 - bx).powi(2) + (y as f32 - by).powi(2);
                    v += amp * (-d2 / (2.0 * r * r)).exp();
                }
                scene[(y * SCENE_SIZE + x) as usize] = v.clamp(0.0, 255.0);
            }
        }
        scene
    }

    /// Crop of the scene shifted by `(3k, 2k)` for the k-th view
    pub fn create_view_image(scene: &[f32], k: u32) -> RgbImage {
        ImageBuffer::from_fn(VIEW_SIZE, VIEW_SIZE, |x, y| {
            let v = scene[((y + 2 * k) * SCENE_SIZE + x + 3 * k) as usize] as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    pub fn write_textured_views(dir: &Path, names: &[&str]) -> Vec<ImageRecord> {
        let scene = create_scene();
        let mut sorted: Vec<&str> = names.to_vec();
        sorted.sort();
        names
            .iter()
            .map(|name| {
                let k = sorted.iter().position(|n| n == name).unwrap_or(0) as u32;
                let path = dir.join(name);
                create_view_image(&scene, k).save(&path).unwrap();
                ImageRecord::new(path, true)
            })
            .collect()
    }

    pub fn write_broken_image(dir: &Path, name: &str) -> ImageRecord {
        let path = dir.join(name);
        std::fs::write(&path, b"not an image").unwrap();
        ImageRecord::new(path, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_textured_views;
    use img2m_core::{Match, ViewPair};
    use img2m_features::{DetectorConfig, OrbParams};
    use img2m_matching::MatcherType;
    use std::collections::HashSet;

    fn create_test_options(matcher_type: MatcherType, num_threads: usize) -> PipelineOptions {
        let mut options = PipelineOptions::default();
        options.matcher = MatcherConfig::with_matcher(matcher_type);
        options.num_threads = num_threads;
        options
    }

    fn create_orb_options() -> PipelineOptions {
        let mut options = create_test_options(MatcherType::BruteForceHamming, 2);
        options.detector = DetectorConfig::Orb(OrbParams::default());
        options
    }

    fn run_pipeline(options: PipelineOptions, images: &[ImageRecord]) -> ResultBundle {
        Img2MatchesPipeline::new(options, images.to_vec()).run().unwrap()
    }

    fn pair_keys(matches: &Matches) -> Vec<(u32, u32)> {
        matches.iter().map(|(pair, _)| (pair.i(), pair.j())).collect()
    }

    #[test]
    fn test_tiny_deterministic_run() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0003.png", "0001.png", "0005.png"]);
        let bundle = run_pipeline(create_test_options(MatcherType::CascadeHashingL2, 1), &images);

        for (view_id, name) in ["0001.png", "0003.png", "0005.png"].iter().enumerate() {
            assert!(bundle.features.get(view_id).unwrap().image_path.ends_with(name));
        }
        assert_eq!(pair_keys(&bundle.matches), vec![(0, 1), (0, 2), (1, 2)]);
        for (pair, matches) in bundle.matches.iter() {
            assert!(matches.len() >= 10, "pair ({}, {}): {} matches", pair.i(), pair.j(), matches.len());
            let nq = bundle.features.get(pair.i() as usize).unwrap().num_keypoints();
            let nt = bundle.features.get(pair.j() as usize).unwrap().num_keypoints();
            assert!(matches.iter().all(|m| m.query_idx < nq && m.train_idx < nt));
        }
    }

    #[test]
    fn test_thread_count_does_not_change_matches() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0003.png", "0005.png"]);
        let single = run_pipeline(create_test_options(MatcherType::CascadeHashingL2, 1), &images);
        let multi = run_pipeline(create_test_options(MatcherType::CascadeHashingL2, 4), &images);
        assert_eq!(single, multi);
    }

    #[test]
    fn test_hamming_on_float_descriptors_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png"]);
        let bundle = run_pipeline(create_test_options(MatcherType::BruteForceHamming, 2), &images);
        let matches = bundle.matches.get(&ViewPair::new(0, 1).unwrap()).unwrap();
        assert!(!matches.is_empty());

        // Same stages as the run, keeping the dispatcher to read its warnings
        let options = create_test_options(MatcherType::BruteForceHamming, 2);
        let pool = build_thread_pool(2).unwrap();
        let extractor = FeatureExtractor::new(options.detector.clone()).unwrap();
        let dispatcher = MatcherDispatcher::new(options.matcher.clone(), extractor.detector_type()).unwrap();
        let extraction = extraction::extract_views(&images, &extractor, &pool, false).unwrap();
        let outcome = PairwiseEngine::new(&dispatcher, 2).match_all(&extraction.views, &pool);
        assert_eq!(outcome.matches, bundle.matches);
        let warnings = dispatcher.downgrade_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("requires") && warnings[0].contains("CV_8U"));
    }

    #[test]
    fn test_cross_check_keeps_a_subset() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0003.png", "0005.png"]);
        let plain = run_pipeline(create_test_options(MatcherType::CascadeHashingL2, 1), &images);
        let mut options = create_test_options(MatcherType::CascadeHashingL2, 1);
        options.matcher.cross_check = true;
        let checked = run_pipeline(options, &images);

        assert!(checked.matches.total_matches() > 0);
        assert!(checked.matches.total_matches() <= plain.matches.total_matches());
        for (pair, matches) in checked.matches.iter() {
            let reference: HashSet<(usize, usize)> = plain
                .matches
                .get(pair)
                .map(|found| found.iter().map(|m| (m.query_idx, m.train_idx)).collect())
                .unwrap_or_default();
            assert!(matches.iter().all(|m| reference.contains(&(m.query_idx, m.train_idx))));
        }
    }

    #[test]
    fn test_exports_reload_to_the_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png", "0003.png"]);
        let mut options = create_orb_options();
        options.export = ExportOptions {
            export_features: true,
            export_fea_path: dir.path().join("storage/features"),
            export_matches: true,
            export_match_path: dir.path().join("storage/matches"),
        };
        let bundle = run_pipeline(options.clone(), &images);

        assert_eq!(load_features(&options.export.export_fea_path).unwrap(), bundle.features);
        assert_eq!(load_matches(&options.export.export_match_path).unwrap(), bundle.matches);
    }

    #[test]
    fn test_reuses_existing_features() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png"]);
        let first = run_pipeline(create_orb_options(), &images);

        let mut reuse = Img2MatchesPipeline::new(create_orb_options(), Vec::new()).with_features(first.features.clone());
        let second = reuse.run().unwrap();
        assert_eq!(second.features, first.features);
        assert_eq!(pair_keys(&second.matches), vec![(0, 1)]);
    }

    #[test]
    fn test_failures_collapse_to_none() {
        let mut empty = Img2MatchesPipeline::new(PipelineOptions::default(), Vec::new());
        assert!(matches!(empty.run(), Err(PipelineError::InputData(_))));
        assert!(empty.run_or_null().is_none());

        let mut options = PipelineOptions::default();
        options.num_threads = 0;
        let mut invalid = Img2MatchesPipeline::new(options, vec![ImageRecord::new("0001.png", true)]);
        assert!(matches!(invalid.run(), Err(PipelineError::Config { .. })));
    }

    #[test]
    fn test_single_view_yields_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png"]);
        let bundle = run_pipeline(create_orb_options(), &images);
        assert!(bundle.matches.is_empty());
        assert_eq!(bundle.features.len(), 1);
    }

    /// Front-end replaying a fixed list of actions
    struct ScriptedFrontend {
        actions: Vec<ViewerAction>,
        seen: Vec<(f32, usize)>,
    }

    impl ViewerFrontend for ScriptedFrontend {
        fn next_action(&mut self, preview: &MatchPreview) -> ViewerAction {
            self.seen.push((preview.ratio_thresh, preview.matches.len()));
            if self.actions.is_empty() {
                ViewerAction::Cancel
            } else {
                self.actions.remove(0)
            }
        }
    }

    #[test]
    fn test_viewer_applies_tuned_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png", "0003.png"]);
        let mut options = create_orb_options();
        options.run_mode = RunMode::Viewer;
        options.viewer.show_view_pair_i = 2;
        options.viewer.show_view_pair_j = 0;

        let mut frontend = ScriptedFrontend {
            actions: vec![
                ViewerAction::Rematch { ratio_thresh: 1.5 },
                ViewerAction::Rematch { ratio_thresh: 0.6 },
                ViewerAction::SetTransparency(0.2),
                ViewerAction::ApplyToAll,
            ],
            seen: Vec::new(),
        };
        let mut pipeline = Img2MatchesPipeline::new(options, images);
        let bundle = pipeline.run_viewer(&mut frontend).unwrap();

        assert_eq!(frontend.seen.len(), 4);
        assert_eq!(frontend.seen[1].0, 0.8);
        assert_eq!(frontend.seen[2].0, 0.6);
        assert!(frontend.seen[2].1 <= frontend.seen[0].1);
        assert_eq!(pipeline.options().matcher.ratio_thresh, 0.6);
        assert_eq!(pipeline.options().viewer.line_transparency, 0.2);
        assert_eq!(bundle.features.len(), 3);
    }

    #[test]
    fn test_viewer_cancel_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png"]);

        let mut frontend = ScriptedFrontend { actions: vec![ViewerAction::Cancel], seen: Vec::new() };
        let mut pipeline = Img2MatchesPipeline::new(create_orb_options(), images.clone());
        assert!(matches!(pipeline.run_viewer(&mut frontend), Err(PipelineError::ViewerCancelled)));

        for (i, j) in [(1, 1), (0, 2)] {
            let mut options = create_orb_options();
            options.viewer.show_view_pair_i = i;
            options.viewer.show_view_pair_j = j;
            let mut pipeline = Img2MatchesPipeline::new(options, images.clone());
            let mut frontend = ScriptedFrontend { actions: Vec::new(), seen: Vec::new() };
            assert!(matches!(pipeline.run_viewer(&mut frontend), Err(PipelineError::Config { .. })));
            assert!(frontend.seen.is_empty());
        }
    }

    #[test]
    fn test_viewer_cancels_after_repeated_invalid_ratios() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png"]);
        let invalid = ViewerAction::Rematch { ratio_thresh: 2.0 };

        let mut frontend = ScriptedFrontend {
            actions: vec![invalid; 10],
            seen: Vec::new(),
        };
        let mut pipeline = Img2MatchesPipeline::new(create_orb_options(), images.clone());
        assert!(matches!(pipeline.run_viewer(&mut frontend), Err(PipelineError::ViewerCancelled)));
        assert_eq!(frontend.seen.len(), MAX_REJECTED_RATIOS);

        // A valid request resets the count
        let mut frontend = ScriptedFrontend {
            actions: vec![invalid, invalid, ViewerAction::Rematch { ratio_thresh: 0.7 }, invalid, invalid, ViewerAction::ApplyToAll],
            seen: Vec::new(),
        };
        let mut pipeline = Img2MatchesPipeline::new(create_orb_options(), images);
        pipeline.run_viewer(&mut frontend).unwrap();
        assert_eq!(pipeline.options().matcher.ratio_thresh, 0.7);
    }

    #[test]
    fn test_headless_viewer_writes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let images = write_textured_views(dir.path(), &["0001.png", "0002.png"]);
        let mut options = create_orb_options();
        options.run_mode = RunMode::Viewer;
        options.export.export_match_path = dir.path().join("matches");

        let preview = preview_path(&options);
        let bundle = Img2MatchesPipeline::new(options, images).run_or_null().unwrap();
        assert!(preview.is_file());
        assert!(bundle.matches.iter().all(|(_, m): (&ViewPair, &Vec<Match>)| !m.is_empty()));
    }
}
