use crate::error::MatchResult;
use img2m_core::{DescriptorMatrix, Match};

/// Backend able to list the nearest train descriptors of every query
pub trait KnnMatcher {
    /// Up to `k` neighbours per query row, closest first
    fn knn_match(&self, query: &DescriptorMatrix, train: &DescriptorMatrix, k: usize) -> MatchResult<Vec<Vec<Match>>>;

    /// Single best matches that agree in both directions
    fn cross_check_match(&self, query: &DescriptorMatrix, train: &DescriptorMatrix) -> MatchResult<Vec<Match>> {
        let forward = self.knn_match(query, train, 1)?;
        let reverse = self.knn_match(train, query, 1)?;
        Ok(symmetric_matches(&forward, &reverse))
    }
}

/// Keep each forward best match whose train row picks it back
pub fn symmetric_matches(forward: &[Vec<Match>], reverse: &[Vec<Match>]) -> Vec<Match> {
    forward
        .iter()
        .filter_map(|neighbours| neighbours.first())
        .filter(|m| {
            reverse
                .get(m.train_idx)
                .and_then(|back| back.first())
                .is_some_and(|back| back.train_idx == m.query_idx)
        })
        .copied()
        .collect()
}

/// Bounded list of the `k` smallest `(distance, index)` entries
#[derive(Debug, Clone)]
pub struct TopK {
    k: usize,
    items: Vec<(f32, usize)>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self { k, items: Vec::with_capacity(k + 1) }
    }

    /// Current k-th distance, infinite while not full
    pub fn worst(&self) -> f32 {
        if self.items.len() < self.k {
            f32::INFINITY
        } else {
            self.items.last().map_or(f32::INFINITY, |w| w.0)
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.items.iter().any(|&(_, i)| i == index)
    }

    pub fn push(&mut self, distance: f32, index: usize) {
        if self.k == 0 || self.contains(index) {
            return;
        }
        let pos = self
            .items
            .partition_point(|&(d, i)| d < distance || (d == distance && i < index));
        if pos >= self.k {
            return;
        }
        self.items.insert(pos, (distance, index));
        self.items.truncate(self.k);
    }

    pub fn capacity(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_matches(self, query_idx: usize) -> Vec<Match> {
        self.items
            .into_iter()
            .map(|(distance, train_idx)| Match::new(query_idx, train_idx, distance))
            .collect()
    }
}
