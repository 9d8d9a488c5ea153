//! Post-processing shared by every backend.

use img2m_core::Match;
use std::cmp::Ordering;

/// Keep the best neighbour of each query whose distance passes
/// `d1 < ratio * d2`. Queries with fewer than two neighbours are dropped.
pub fn ratio_test(knn: &[Vec<Match>], ratio: f32) -> Vec<Match> {
    knn.iter()
        .filter_map(|neighbours| match neighbours.as_slice() {
            [best, second, ..] if best.distance < ratio * second.distance => Some(*best),
            _ => None,
        })
        .collect()
}

/// Order by query, then train, then distance
pub fn compare_matches(a: &Match, b: &Match) -> Ordering {
    a.query_idx
        .cmp(&b.query_idx)
        .then(a.train_idx.cmp(&b.train_idx))
        .then(a.distance.total_cmp(&b.distance))
}

/// Sort and keep the closest match of every `(query, train)` pair
pub fn remove_duplicates(matches: &mut Vec<Match>) {
    matches.sort_by(compare_matches);
    matches.dedup_by(|later, earlier| later.query_idx == earlier.query_idx && later.train_idx == earlier.train_idx);
}

/// Keep the `max_matches` closest matches; 0 keeps everything
pub fn keep_best(matches: &mut Vec<Match>, max_matches: usize) {
    if max_matches == 0 {
        return;
    }
    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(compare_matches(a, b)));
    matches.truncate(max_matches);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_remove_duplicates_keeps_closest() {
        let mut matches = vec![
            Match::new(1, 4, 0.5),
            Match::new(0, 2, 0.3),
            Match::new(1, 4, 0.2),
            Match::new(1, 3, 0.9),
        ];
        remove_duplicates(&mut matches);
        assert_eq!(matches, vec![Match::new(0, 2, 0.3), Match::new(1, 3, 0.9), Match::new(1, 4, 0.2)]);
    }

    #[test]
    fn test_keep_best() {
        let mut matches = vec![Match::new(0, 0, 3.0), Match::new(1, 1, 1.0), Match::new(2, 2, 2.0)];
        keep_best(&mut matches, 0);
        assert_eq!(matches.len(), 3);
        keep_best(&mut matches, 2);
        assert_eq!(matches, vec![Match::new(1, 1, 1.0), Match::new(2, 2, 2.0)]);
    }

    #[test]
    fn test_ratio_test_skips_short_lists() {
        let knn = vec![vec![Match::new(0, 1, 0.1)], vec![], vec![Match::new(2, 0, 1.0), Match::new(2, 1, 1.0)]];
        assert!(ratio_test(&knn, 0.8).is_empty());
    }

    proptest! {
        #[test]
        fn ratio_test_accepts_exactly_distinctive_matches(
            pairs in prop::collection::vec((0.0f32..100.0, 0.0f32..100.0), 0..50),
            ratio in 0.05f32..0.95,
        ) {
            let knn: Vec<Vec<Match>> = pairs
                .iter()
                .enumerate()
                .map(|(q, &(a, b))| {
                    let (d1, d2) = if a <= b { (a, b) } else { (b, a) };
                    vec![Match::new(q, 0, d1), Match::new(q, 1, d2)]
                })
                .collect();
            let kept = ratio_test(&knn, ratio);
            let expected = knn.iter().filter(|n| n[0].distance < ratio * n[1].distance).count();
            prop_assert_eq!(kept.len(), expected);
            for m in &kept {
                prop_assert_eq!(m.train_idx, 0);
                prop_assert!(m.distance < ratio * knn[m.query_idx][1].distance);
            }
        }
    }
}
