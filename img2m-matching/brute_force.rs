//! Exhaustive matchers, parallel over query rows.

use crate::distance::{hamming, l1, l2};
use crate::error::{MatchError, MatchResult};
use crate::knn::{KnnMatcher, TopK};
use img2m_core::{DescriptorMatrix, DescriptorType, Descriptors, Match};
use rayon::prelude::*;
use std::borrow::Cow;

/// Distance used by a brute-force matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    L2,
    L1,
    Hamming,
}

impl Norm {
    pub fn name(&self) -> &'static str {
        match self {
            Norm::L2 => "BRUTE_FORCE_L2",
            Norm::L1 => "BRUTE_FORCE_L1",
            Norm::Hamming => "BRUTE_FORCE_HAMMING",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BruteForceMatcher {
    norm: Norm,
}

impl BruteForceMatcher {
    pub fn new(norm: Norm) -> Self {
        Self { norm }
    }

    pub fn norm(&self) -> Norm {
        self.norm
    }

    /// L2 and L1 accept any element type; Hamming needs `u8`
    pub fn accepts(&self, descriptor_type: DescriptorType) -> bool {
        self.norm != Norm::Hamming || descriptor_type == DescriptorType::U8
    }
}

impl KnnMatcher for BruteForceMatcher {
    fn knn_match(&self, query: &DescriptorMatrix, train: &DescriptorMatrix, k: usize) -> MatchResult<Vec<Vec<Match>>> {
        if query.is_empty() || train.is_empty() {
            return Err(MatchError::EmptyDescriptors);
        }
        if query.cols() != train.cols() {
            return Err(MatchError::DimensionMismatch { query: query.cols(), train: train.cols() });
        }
        match self.norm {
            Norm::L2 | Norm::L1 => {
                let (q, t) = (as_float(query), as_float(train));
                let distance = if self.norm == Norm::L2 { l2 } else { l1 };
                Ok(knn_exhaustive(&*q, &*t, k, distance))
            }
            Norm::Hamming => {
                let (q, t) = match (query.as_binary(), train.as_binary()) {
                    (Some(q), Some(t)) => (q, t),
                    (Some(_), None) => return Err(incompatible(train.descriptor_type())),
                    _ => return Err(incompatible(query.descriptor_type())),
                };
                Ok(knn_exhaustive(q, t, k, |a, b| hamming(a, b) as f32))
            }
        }
    }
}

fn incompatible(found: DescriptorType) -> MatchError {
    MatchError::IncompatibleDescriptors {
        backend: Norm::Hamming.name(),
        required: DescriptorType::U8,
        found,
    }
}

/// Borrow float descriptors, promoting `u8` ones
fn as_float(descriptors: &DescriptorMatrix) -> Cow<'_, Descriptors<f32>> {
    match descriptors.as_float() {
        Some(d) => Cow::Borrowed(d),
        None => Cow::Owned(descriptors.to_f32()),
    }
}

/// `k` nearest train rows of every query row under `distance`
pub fn knn_exhaustive<T, F>(query: &Descriptors<T>, train: &Descriptors<T>, k: usize, distance: F) -> Vec<Vec<Match>>
where
    T: Copy + Default + Sync,
    F: Fn(&[T], &[T]) -> f32 + Sync,
{
    (0..query.rows())
        .into_par_iter()
        .map(|q| {
            let row = query.row(q);
            let mut top = TopK::new(k);
            for (t, candidate) in train.iter_rows().enumerate() {
                let d = distance(row, candidate);
                if d <= top.worst() {
                    top.push(d, t);
                }
            }
            top.into_matches(q)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_set(rows: &[[f32; 3]]) -> DescriptorMatrix {
        Descriptors::from_rows(3, rows).unwrap().into()
    }

    fn binary_set(rows: &[[u8; 2]]) -> DescriptorMatrix {
        Descriptors::from_rows(2, rows).unwrap().into()
    }

    #[test]
    fn test_l2_knn() {
        let query = float_set(&[[0.0, 0.0, 0.0], [10.0, 10.0, 10.0]]);
        let train = float_set(&[[1.0, 0.0, 0.0], [9.0, 10.0, 10.0], [0.0, 3.0, 0.0]]);
        let knn = BruteForceMatcher::new(Norm::L2).knn_match(&query, &train, 2).unwrap();
        assert_eq!(knn[0], vec![Match::new(0, 0, 1.0), Match::new(0, 2, 3.0)]);
        assert_eq!(knn[1][0], Match::new(1, 1, 1.0));
    }

    #[test]
    fn test_l1_promotes_binary() {
        let query = binary_set(&[[0, 0]]);
        let train = binary_set(&[[3, 4], [1, 1]]);
        let knn = BruteForceMatcher::new(Norm::L1).knn_match(&query, &train, 1).unwrap();
        assert_eq!(knn[0], vec![Match::new(0, 1, 2.0)]);
    }

    #[test]
    fn test_hamming() {
        let query = binary_set(&[[0b1111_0000, 0]]);
        let train = binary_set(&[[0b1111_0001, 0], [0, 0]]);
        let matcher = BruteForceMatcher::new(Norm::Hamming);
        let knn = matcher.knn_match(&query, &train, 2).unwrap();
        assert_eq!(knn[0], vec![Match::new(0, 0, 1.0), Match::new(0, 1, 4.0)]);

        let floats = float_set(&[[0.0, 0.0, 0.0]]);
        assert!(!matcher.accepts(DescriptorType::F32));
        assert!(matches!(
            matcher.knn_match(&floats, &floats, 1),
            Err(MatchError::IncompatibleDescriptors { required: DescriptorType::U8, .. })
        ));
    }

    #[test]
    fn test_cross_check_is_symmetric() {
        let query = float_set(&[[0.0, 0.0, 0.0], [0.3, 0.0, 0.0], [5.0, 5.0, 5.0]]);
        let train = float_set(&[[0.1, 0.0, 0.0], [5.0, 5.0, 5.1]]);
        let matches = BruteForceMatcher::new(Norm::L2).cross_check_match(&query, &train).unwrap();
        // queries 0 and 1 both pick train 0, which only picks query 0 back
        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].query_idx, matches[0].train_idx), (0, 0));
        assert_eq!((matches[1].query_idx, matches[1].train_idx), (2, 1));
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let a = float_set(&[[0.0, 0.0, 0.0]]);
        let b: DescriptorMatrix = Descriptors::from_rows(2, &[[0.0f32, 0.0]]).unwrap().into();
        let matcher = BruteForceMatcher::new(Norm::L2);
        assert!(matches!(matcher.knn_match(&a, &b, 1), Err(MatchError::DimensionMismatch { query: 3, train: 2 })));
        let empty = DescriptorMatrix::empty(DescriptorType::F32, 3);
        assert!(matches!(matcher.knn_match(&empty, &a, 1), Err(MatchError::EmptyDescriptors)));
    }
}
