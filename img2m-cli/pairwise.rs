//! Matching of every unordered view pair.

use crate::extraction::ExtractedView;
use img2m_core::{Match, Matches, ProgressTracker, ViewPair};
use img2m_matching::{MatchResult, MatcherDispatcher};
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Seed of the randomized matcher state for one pair. Depends only on the
/// view ids, so results do not depend on which worker handles the pair.
pub fn pair_seed(vi: u32, vj: u32) -> u32 {
    let packed = (vi << 16) | vj;
    let mixed = vi.wrapping_mul(7919).wrapping_add(vj.wrapping_mul(7927));
    12345 ^ packed ^ mixed
}

/// Index pairs `(a, b)` with `a < b`, in lexicographic order
pub fn pair_indices(num_views: usize) -> Vec<(usize, usize)> {
    (0..num_views)
        .flat_map(|a| (a + 1..num_views).map(move |b| (a, b)))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct PairwiseOutcome {
    pub matches: Matches,
    pub attempted_pairs: usize,
    /// Pairs stored with at least one match
    pub matched_pairs: usize,
}

pub struct PairwiseEngine<'a> {
    dispatcher: &'a MatcherDispatcher,
    num_threads: usize,
}

impl<'a> PairwiseEngine<'a> {
    pub fn new(dispatcher: &'a MatcherDispatcher, num_threads: usize) -> Self {
        Self {
            dispatcher,
            num_threads: num_threads.max(1),
        }
    }

    /// Match all pairs of `views`, which must be in view id order.
    ///
    /// With more than one thread the pair list is cut into `num_threads`
    /// contiguous chunks run on `pool`. Failed or empty pairs are dropped.
    pub fn match_all(&self, views: &[ExtractedView], pool: &ThreadPool) -> PairwiseOutcome {
        let pairs = pair_indices(views.len());
        if pairs.is_empty() {
            info!("Fewer than two views with features, nothing to match");
            return PairwiseOutcome::default();
        }

        info!(
            "Matching {} view pairs with {} on {} thread(s)",
            pairs.len(),
            self.dispatcher.matcher_type().config_name(),
            self.num_threads
        );
        let start = Instant::now();
        let progress = ProgressTracker::new("Pairwise matching", pairs.len());

        let matches = if self.num_threads == 1 {
            let mut matches = Matches::new();
            for &(a, b) in &pairs {
                if let Some((pair, found)) = self.match_pair(&views[a], &views[b]) {
                    matches.insert(pair, found);
                }
                progress.advance();
            }
            matches
        } else {
            let shared = Mutex::new(Matches::new());
            let chunk_size = pairs.len().div_ceil(self.num_threads);
            pool.install(|| {
                pairs.par_chunks(chunk_size).for_each(|chunk| {
                    for &(a, b) in chunk {
                        if let Some((pair, found)) = self.match_pair(&views[a], &views[b]) {
                            lock(&shared).insert(pair, found);
                        }
                        progress.advance();
                    }
                });
            });
            shared.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
        };

        let matched_pairs = matches.len();
        info!(
            "Matched {} of {} pairs ({} matches) in {:.2?}",
            matched_pairs,
            pairs.len(),
            matches.total_matches(),
            start.elapsed()
        );
        PairwiseOutcome {
            matches,
            attempted_pairs: pairs.len(),
            matched_pairs,
        }
    }

    fn match_pair(&self, query: &ExtractedView, train: &ExtractedView) -> Option<(ViewPair, Vec<Match>)> {
        let pair = match ViewPair::new(query.view_id, train.view_id) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("Skipping pair: {}", e);
                return None;
            }
        };
        match match_views(self.dispatcher, query, train) {
            Ok(found) if !found.is_empty() => {
                debug!("View pair ({}, {}): {} matches", pair.i(), pair.j(), found.len());
                Some((pair, found))
            }
            Ok(_) => {
                debug!("View pair ({}, {}): no matches", pair.i(), pair.j());
                None
            }
            Err(e) => {
                debug!("View pair ({}, {}) dropped: {}", pair.i(), pair.j(), e);
                None
            }
        }
    }
}

/// Match two views with the pair seed, on pixels when both images are
/// cached and the backend wants them
pub fn match_views(dispatcher: &MatcherDispatcher, query: &ExtractedView, train: &ExtractedView) -> MatchResult<Vec<Match>> {
    let seed = pair_seed(query.view_id, train.view_id);
    if dispatcher.needs_images() {
        if let (Some(q), Some(t)) = (query.view_data(), train.view_data()) {
            return dispatcher.match_views(&q, &t, seed);
        }
    }
    dispatcher.match_descriptors(&query.descriptors, &train.descriptors, seed)
}

fn lock(matches: &Mutex<Matches>) -> MutexGuard<'_, Matches> {
    match matches.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use img2m_core::{build_thread_pool, DescriptorMatrix, Descriptors, DetectorType};
    use img2m_matching::{MatcherConfig, MatcherType};
    use proptest::prelude::*;
    use std::path::PathBuf;

    /// Views sharing one descriptor set under small view-specific offsets
    fn create_views(num_views: usize, rows: usize) -> Vec<ExtractedView> {
        let base: Vec<f32> = (0..rows * 128)
            .map(|i| ((i as u32).wrapping_mul(2_654_435_761) % 1000) as f32 / 1000.0)
            .collect();
        (0..num_views)
            .map(|v| {
                let data: Vec<f32> = base
                    .iter()
                    .enumerate()
                    .map(|(i, x)| x + ((i * 31 + v * 17) % 11) as f32 * 0.001)
                    .collect();
                ExtractedView {
                    view_id: v as u32,
                    path: PathBuf::from(format!("{:04}.png", v)),
                    keypoints: Vec::new(),
                    descriptors: Descriptors::from_vec(rows, 128, data).unwrap().into(),
                    image: None,
                }
            })
            .collect()
    }

    fn create_dispatcher(matcher_type: MatcherType) -> MatcherDispatcher {
        MatcherDispatcher::new(MatcherConfig::with_matcher(matcher_type), DetectorType::Sift).unwrap()
    }

    #[test]
    fn test_pair_seed_values() {
        assert_eq!(pair_seed(0, 1), 11983);
        assert_eq!(pair_seed(1, 2), 93414);
        assert_ne!(pair_seed(0, 1), pair_seed(1, 0));
    }

    #[test]
    fn test_pair_indices_lexicographic() {
        assert_eq!(pair_indices(3), vec![(0, 1), (0, 2), (1, 2)]);
        assert!(pair_indices(1).is_empty());
        assert_eq!(pair_indices(10).len(), 45);
    }

    #[test]
    fn test_same_matches_for_any_thread_count() {
        let views = create_views(5, 300);
        for matcher_type in [MatcherType::CascadeHashingL2, MatcherType::Flann, MatcherType::BruteForceL2] {
            let single = PairwiseEngine::new(&create_dispatcher(matcher_type), 1)
                .match_all(&views, &build_thread_pool(1).unwrap());
            assert_eq!(single.attempted_pairs, 10);
            assert!(single.matched_pairs > 0, "{:?}", matcher_type);

            for threads in [2, 4, 8] {
                let multi = PairwiseEngine::new(&create_dispatcher(matcher_type), threads)
                    .match_all(&views, &build_thread_pool(threads).unwrap());
                assert_eq!(multi.matches, single.matches, "{:?} with {} threads", matcher_type, threads);
            }
        }
    }

    #[test]
    fn test_failed_pairs_are_dropped() {
        let mut views = create_views(3, 50);
        views[1].descriptors = DescriptorMatrix::from(Descriptors::from_vec(1, 4, vec![0.0f32; 4]).unwrap());
        let outcome = PairwiseEngine::new(&create_dispatcher(MatcherType::BruteForceL2), 2)
            .match_all(&views, &build_thread_pool(2).unwrap());
        assert_eq!(outcome.attempted_pairs, 3);
        assert_eq!(outcome.matched_pairs, outcome.matches.len());
        assert!(outcome.matches.get(&ViewPair::new(0, 1).unwrap()).is_none());
        assert!(outcome.matches.get(&ViewPair::new(1, 2).unwrap()).is_none());
    }

    #[test]
    fn test_single_view_matches_nothing() {
        let views = create_views(1, 10);
        let outcome = PairwiseEngine::new(&create_dispatcher(MatcherType::BruteForceL2), 4)
            .match_all(&views, &build_thread_pool(4).unwrap());
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.attempted_pairs, 0);
    }

    proptest! {
        #[test]
        fn prop_pair_keys_are_canonical(ids in prop::collection::btree_set(0u32..500, 2..8)) {
            let mut views = create_views(ids.len(), 20);
            for (view, id) in views.iter_mut().zip(&ids) {
                view.view_id = *id;
            }
            let outcome = PairwiseEngine::new(&create_dispatcher(MatcherType::BruteForceL2), 1)
                .match_all(&views, &build_thread_pool(1).unwrap());
            for (pair, matches) in outcome.matches.iter() {
                prop_assert!(pair.i() < pair.j());
                prop_assert!(!matches.is_empty());
            }
        }
    }
}
