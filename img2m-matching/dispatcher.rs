//! Backend selection with descriptor-type downgrades.

use crate::brute_force::{BruteForceMatcher, Norm};
use crate::cascade::{CascadeHasher, CascadeHashingMatcher};
use crate::config::{FlannAlgorithm, MatcherConfig, MatcherType};
use crate::error::{MatchError, MatchResult};
use crate::filter::{keep_best, ratio_test};
use crate::flann::FlannMatcher;
use crate::knn::KnnMatcher;
use crate::lightglue::{LightGlueMatcher, ViewData};
use img2m_core::{DescriptorMatrix, DescriptorType, DetectorType, Match};
use log::{debug, warn};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Per-run matcher shared by every pair.
///
/// Cascade-hashing projections are built on first use and reused for the
/// rest of the run. Downgrade warnings are logged once per run.
pub struct MatcherDispatcher {
    config: MatcherConfig,
    detector: DetectorType,
    hasher: OnceLock<Arc<CascadeHasher>>,
    warned: [AtomicBool; 4],
}

const WARN_CASCADE: usize = 0;
const WARN_FLANN: usize = 1;
const WARN_HAMMING: usize = 2;
const WARN_LSH: usize = 3;

const DOWNGRADE_MESSAGES: [&str; 4] = [
    "cascade hashing matcher requires CV_32F descriptors, using BRUTE_FORCE_L2",
    "FLANN matcher requires CV_32F descriptors, using BRUTE_FORCE_L2",
    "BF_HAMMING matcher requires CV_8U descriptors, using BRUTE_FORCE_L2",
    "LSH index requires CV_8U descriptors, using KDTREE",
];

impl MatcherDispatcher {
    pub fn new(config: MatcherConfig, detector: DetectorType) -> MatchResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            detector,
            hasher: OnceLock::new(),
            warned: Default::default(),
        })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn detector(&self) -> DetectorType {
        self.detector
    }

    pub fn matcher_type(&self) -> MatcherType {
        self.config.matcher_type
    }

    /// Whether pairs should be matched with their images
    pub fn needs_images(&self) -> bool {
        self.config.matcher_type == MatcherType::LightGlue
    }

    /// Backend used for descriptors of `descriptor_type`, after downgrades.
    /// LightGlue resolves as cascade hashing, its descriptor-only fallback.
    pub fn resolve(&self, descriptor_type: DescriptorType) -> MatcherType {
        let is_float = descriptor_type == DescriptorType::F32;
        match self.config.matcher_type {
            MatcherType::CascadeHashingL2 | MatcherType::LightGlue => {
                if is_float {
                    MatcherType::CascadeHashingL2
                } else {
                    self.warn_once(WARN_CASCADE);
                    MatcherType::BruteForceL2
                }
            }
            MatcherType::Flann => {
                let flann = FlannMatcher::new(&self.config.flann, self.detector, 0);
                if !flann.accepts(descriptor_type) {
                    self.warn_once(WARN_FLANN);
                    return MatcherType::BruteForceL2;
                }
                if flann.index_algorithm(descriptor_type) != flann.algorithm() {
                    self.warn_once(WARN_LSH);
                }
                MatcherType::Flann
            }
            MatcherType::BruteForceHamming if is_float => {
                self.warn_once(WARN_HAMMING);
                MatcherType::BruteForceL2
            }
            other => other,
        }
    }

    /// Match two descriptor sets. `seed` drives every randomized index.
    pub fn match_descriptors(&self, query: &DescriptorMatrix, train: &DescriptorMatrix, seed: u32) -> MatchResult<Vec<Match>> {
        if query.is_empty() || train.is_empty() {
            return Err(MatchError::EmptyDescriptors);
        }
        let query_type = query.descriptor_type();
        let train: Cow<'_, DescriptorMatrix> = if train.descriptor_type() == query_type {
            Cow::Borrowed(train)
        } else {
            Cow::Owned(train.clone().coerce(query_type))
        };
        let train = train.as_ref();

        let backend = self.resolve(query_type);
        debug!("matching {}x{} descriptors with {}", query.rows(), train.rows(), backend.backend_name());
        match backend {
            MatcherType::CascadeHashingL2 => self.match_cascade(query, train),
            MatcherType::Flann => {
                self.match_knn(&FlannMatcher::new(&self.config.flann, self.detector, u64::from(seed)), query, train)
            }
            MatcherType::BruteForceL1 => self.match_knn(&BruteForceMatcher::new(Norm::L1), query, train),
            MatcherType::BruteForceHamming => self.match_knn(&BruteForceMatcher::new(Norm::Hamming), query, train),
            _ => self.match_knn(&BruteForceMatcher::new(Norm::L2), query, train),
        }
    }

    /// Match two views, using LightGlue when configured and falling back to
    /// descriptor matching when it fails
    pub fn match_views(&self, query: &ViewData<'_>, train: &ViewData<'_>, seed: u32) -> MatchResult<Vec<Match>> {
        if self.needs_images() {
            match LightGlueMatcher::new(self.config.lightglue.clone()).match_pair(query, train) {
                Ok(mut matches) => {
                    keep_best(&mut matches, self.config.max_matches);
                    return Ok(matches);
                }
                Err(e) => warn!("LightGlue matching failed ({}), falling back to FASTCASCADEHASHINGL2", e),
            }
        }
        self.match_descriptors(query.descriptors, train.descriptors, seed)
    }

    /// Projections for `dim`-column descriptors; the shared set is built
    /// from the first pair seen
    pub fn hasher_for(&self, dim: usize) -> Arc<CascadeHasher> {
        let shared = self.hasher.get_or_init(|| Arc::new(CascadeHasher::new(dim)));
        if shared.dim() == dim {
            Arc::clone(shared)
        } else {
            Arc::new(CascadeHasher::new(dim))
        }
    }

    fn match_cascade(&self, query: &DescriptorMatrix, train: &DescriptorMatrix) -> MatchResult<Vec<Match>> {
        let (Some(q), Some(t)) = (query.as_float(), train.as_float()) else {
            return Err(MatchError::IncompatibleDescriptors {
                backend: MatcherType::CascadeHashingL2.backend_name(),
                required: DescriptorType::F32,
                found: DescriptorType::U8,
            });
        };
        let matcher = CascadeHashingMatcher::new(self.hasher_for(q.cols()), self.config.ratio_thresh);
        matcher.match_descriptors(q, t, self.config.cross_check)
    }

    fn match_knn<M: KnnMatcher>(&self, matcher: &M, query: &DescriptorMatrix, train: &DescriptorMatrix) -> MatchResult<Vec<Match>> {
        let mut matches = if self.config.cross_check {
            matcher.cross_check_match(query, train)?
        } else {
            ratio_test(&matcher.knn_match(query, train, 2)?, self.config.ratio_thresh)
        };
        keep_best(&mut matches, self.config.max_matches);
        Ok(matches)
    }

    /// Downgrade warnings logged so far, in a fixed order
    pub fn downgrade_warnings(&self) -> Vec<&'static str> {
        self.warned
            .iter()
            .zip(DOWNGRADE_MESSAGES)
            .filter(|(flag, _)| flag.load(Ordering::Relaxed))
            .map(|(_, message)| message)
            .collect()
    }

    fn warn_once(&self, slot: usize) {
        if !self.warned[slot].swap(true, Ordering::Relaxed) {
            warn!("{}", DOWNGRADE_MESSAGES[slot]);
        }
    }
}

/// FLANN algorithm used for the canonical descriptors of `detector`
pub fn flann_algorithm_for(config: &MatcherConfig, detector: DetectorType) -> FlannAlgorithm {
    FlannMatcher::new(&config.flann, detector, 0).index_algorithm(detector.descriptor_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma};
    use img2m_core::{Descriptors, Keypoint};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn create_test_config(matcher_type: MatcherType) -> MatcherConfig {
        MatcherConfig::with_matcher(matcher_type)
    }

    fn float_pair(rows: usize, cols: usize) -> (DescriptorMatrix, DescriptorMatrix) {
        let mut rng = Pcg64::seed_from_u64(42);
        let train: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(0.0f32..1.0)).collect();
        let query: Vec<f32> = train.iter().map(|v| v + rng.gen_range(-0.005f32..0.005)).collect();
        (
            Descriptors::from_vec(rows, cols, query).unwrap().into(),
            Descriptors::from_vec(rows, cols, train).unwrap().into(),
        )
    }

    fn binary_pair(rows: usize, cols: usize) -> (DescriptorMatrix, DescriptorMatrix) {
        let mut rng = Pcg64::seed_from_u64(43);
        let train: Vec<u8> = (0..rows * cols).map(|_| rng.gen()).collect();
        let mut query = train.clone();
        for row in query.chunks_mut(cols) {
            row[0] ^= 0b0000_0101;
        }
        (
            Descriptors::from_vec(rows, cols, query).unwrap().into(),
            Descriptors::from_vec(rows, cols, train).unwrap().into(),
        )
    }

    fn identity_share(matches: &[Match]) -> f32 {
        matches.iter().filter(|m| m.query_idx == m.train_idx).count() as f32 / matches.len().max(1) as f32
    }

    #[test]
    fn test_downgrades() {
        let cascade = MatcherDispatcher::new(create_test_config(MatcherType::CascadeHashingL2), DetectorType::Orb).unwrap();
        assert_eq!(cascade.resolve(DescriptorType::U8), MatcherType::BruteForceL2);
        assert_eq!(cascade.resolve(DescriptorType::F32), MatcherType::CascadeHashingL2);

        let hamming = MatcherDispatcher::new(create_test_config(MatcherType::BruteForceHamming), DetectorType::Sift).unwrap();
        assert_eq!(hamming.resolve(DescriptorType::F32), MatcherType::BruteForceL2);
        assert_eq!(hamming.resolve(DescriptorType::U8), MatcherType::BruteForceHamming);

        let flann_sift = MatcherDispatcher::new(create_test_config(MatcherType::Flann), DetectorType::Fast).unwrap();
        assert_eq!(flann_sift.resolve(DescriptorType::U8), MatcherType::BruteForceL2);
        let flann_orb = MatcherDispatcher::new(create_test_config(MatcherType::Flann), DetectorType::Orb).unwrap();
        assert_eq!(flann_orb.resolve(DescriptorType::U8), MatcherType::Flann);

        let lightglue = MatcherDispatcher::new(create_test_config(MatcherType::LightGlue), DetectorType::Sift).unwrap();
        assert!(lightglue.needs_images());
        assert_eq!(lightglue.resolve(DescriptorType::F32), MatcherType::CascadeHashingL2);
        assert_eq!(lightglue.resolve(DescriptorType::U8), MatcherType::BruteForceL2);
    }

    #[test]
    fn test_hamming_on_float_warns_once_and_matches() {
        let (query, train) = float_pair(200, 32);
        let dispatcher = MatcherDispatcher::new(create_test_config(MatcherType::BruteForceHamming), DetectorType::Sift).unwrap();
        assert!(dispatcher.downgrade_warnings().is_empty());

        let matches = dispatcher.match_descriptors(&query, &train, 1).unwrap();
        assert!(!matches.is_empty());
        dispatcher.match_descriptors(&query, &train, 2).unwrap();
        let warnings = dispatcher.downgrade_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("requires") && warnings[0].contains("CV_8U"), "{}", warnings[0]);
    }

    #[test]
    fn test_every_backend_matches_float_copies() {
        let (query, train) = float_pair(300, 32);
        for matcher_type in MatcherType::ALL {
            let dispatcher = MatcherDispatcher::new(create_test_config(matcher_type), DetectorType::Sift).unwrap();
            let matches = dispatcher.match_descriptors(&query, &train, 7).unwrap();
            assert!(!matches.is_empty(), "{:?} found nothing", matcher_type);
            assert!(identity_share(&matches) > 0.9, "{:?}", matcher_type);
        }
    }

    #[test]
    fn test_binary_backends() {
        let (query, train) = binary_pair(150, 32);
        for matcher_type in [MatcherType::BruteForceHamming, MatcherType::Flann, MatcherType::CascadeHashingL2] {
            let dispatcher = MatcherDispatcher::new(create_test_config(matcher_type), DetectorType::Orb).unwrap();
            let matches = dispatcher.match_descriptors(&query, &train, 3).unwrap();
            // LSH often finds no second neighbour, which the ratio test rejects
            let expected = if matcher_type == MatcherType::Flann { 1 } else { 100 };
            assert!(matches.len() >= expected, "{:?}: {}", matcher_type, matches.len());
            assert_eq!(identity_share(&matches), 1.0);
        }
    }

    #[test]
    fn test_max_matches_and_cross_check() {
        let (query, train) = float_pair(100, 16);
        let config = MatcherConfig { max_matches: 10, ..create_test_config(MatcherType::BruteForceL2) };
        let dispatcher = MatcherDispatcher::new(config, DetectorType::Sift).unwrap();
        let matches = dispatcher.match_descriptors(&query, &train, 0).unwrap();
        assert_eq!(matches.len(), 10);
        assert!(matches.windows(2).all(|w| w[0].distance <= w[1].distance));

        let config = MatcherConfig { cross_check: true, ..create_test_config(MatcherType::BruteForceL1) };
        let dispatcher = MatcherDispatcher::new(config, DetectorType::Sift).unwrap();
        let matches = dispatcher.match_descriptors(&query, &train, 0).unwrap();
        assert_eq!(matches.len(), 100);
        assert_eq!(identity_share(&matches), 1.0);
    }

    #[test]
    fn test_cascade_ignores_max_matches() {
        let (query, train) = float_pair(300, 32);
        let config = MatcherConfig { max_matches: 5, ..create_test_config(MatcherType::CascadeHashingL2) };
        let dispatcher = MatcherDispatcher::new(config, DetectorType::Sift).unwrap();
        assert!(dispatcher.match_descriptors(&query, &train, 0).unwrap().len() > 5);
    }

    #[test]
    fn test_hasher_is_shared() {
        let dispatcher = MatcherDispatcher::new(MatcherConfig::default(), DetectorType::Sift).unwrap();
        let a = dispatcher.hasher_for(128);
        let b = dispatcher.hasher_for(128);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dispatcher.hasher_for(64).dim(), 64);
    }

    #[test]
    fn test_lightglue_failure_falls_back() {
        let (query, train) = float_pair(200, 32);
        let img: GrayImage = ImageBuffer::from_pixel(8, 8, Luma([0u8]));
        let kps: Vec<Keypoint> = (0..200).map(|i| Keypoint::new(i as f32, 0.0, 1.0, 0.0, 0.0)).collect();
        let q = ViewData { image: &img, keypoints: &kps, descriptors: &query };
        let t = ViewData { image: &img, keypoints: &kps, descriptors: &train };
        let dispatcher = MatcherDispatcher::new(create_test_config(MatcherType::LightGlue), DetectorType::Sift).unwrap();
        let matches = dispatcher.match_views(&q, &t, 1).unwrap();
        assert!(identity_share(&matches) > 0.9);
    }

    #[test]
    fn test_rejects_invalid_config_and_empty_input() {
        let config = MatcherConfig { ratio_thresh: 0.0, ..MatcherConfig::default() };
        assert!(MatcherDispatcher::new(config, DetectorType::Sift).is_err());

        let dispatcher = MatcherDispatcher::new(MatcherConfig::default(), DetectorType::Sift).unwrap();
        let empty = DescriptorMatrix::empty(DescriptorType::F32, 128);
        let (_, train) = float_pair(4, 128);
        assert!(matches!(dispatcher.match_descriptors(&empty, &train, 0), Err(MatchError::EmptyDescriptors)));
    }

    #[test]
    fn test_flann_algorithm_for_detector() {
        let config = create_test_config(MatcherType::Flann);
        assert_eq!(flann_algorithm_for(&config, DetectorType::Sift), FlannAlgorithm::KdTree);
        assert_eq!(flann_algorithm_for(&config, DetectorType::Orb), FlannAlgorithm::Lsh);
    }
}
