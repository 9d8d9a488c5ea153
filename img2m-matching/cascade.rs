//! Cascade-hashing approximate nearest-neighbour search for `f32` descriptors.
//!
//! Each descriptor is projected twice: a `D`-bit primary code compared by
//! Hamming distance, and [`BUCKET_GROUPS`] secondary codes of
//! [`BITS_PER_BUCKET`] bits that index hash buckets. A query only looks at the
//! database entries sharing one of its buckets, ranks them by Hamming
//! distance, then refines the best [`TOP_HAMMING_CANDIDATES`] with the exact
//! Euclidean distance.

use crate::distance::{hamming_words, l2};
use crate::error::{MatchError, MatchResult};
use crate::filter::{ratio_test, remove_duplicates};
use img2m_core::{Descriptors, Match};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_pcg::Pcg64;
use std::collections::HashSet;
use std::sync::Arc;

pub const BUCKET_GROUPS: usize = 6;
pub const BITS_PER_BUCKET: usize = 10;
pub const BUCKETS_PER_GROUP: usize = 1 << BITS_PER_BUCKET;
pub const TOP_HAMMING_CANDIDATES: usize = 10;
pub const DEFAULT_SEED: u64 = 5489;

/// Primary code and bucket ids of one descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedDescriptor {
    /// `D` sign bits packed into 64-bit words
    pub hash_code: Vec<u64>,
    pub bucket_ids: [u16; BUCKET_GROUPS],
}

/// Hashed descriptor set with its bucket index
#[derive(Debug, Clone)]
pub struct HashedDescriptors {
    pub hashed: Vec<HashedDescriptor>,
    /// `buckets[group][bucket_id]` lists descriptor indices
    pub buckets: Vec<Vec<Vec<usize>>>,
}

impl HashedDescriptors {
    pub fn len(&self) -> usize {
        self.hashed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashed.is_empty()
    }
}

/// Random projections shared by database and query sides
#[derive(Debug, Clone)]
pub struct CascadeHasher {
    dim: usize,
    /// Row-major `D x D`
    primary: Vec<f32>,
    /// One row-major `B x D` matrix per group
    secondary: Vec<Vec<f32>>,
}

impl CascadeHasher {
    pub fn new(dim: usize) -> Self {
        Self::with_seed(dim, DEFAULT_SEED)
    }

    pub fn with_seed(dim: usize, seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut draw = |n: usize| -> Vec<f32> { (0..n).map(|_| Distribution::<f32>::sample(&StandardNormal, &mut rng)).collect() };
        let primary = draw(dim * dim);
        let secondary = (0..BUCKET_GROUPS).map(|_| draw(BITS_PER_BUCKET * dim)).collect();
        Self { dim, primary, secondary }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Column mean of a descriptor matrix
    pub fn zero_mean(descriptors: &Descriptors<f32>) -> Vec<f32> {
        let mut mean = vec![0.0f32; descriptors.cols()];
        if descriptors.is_empty() {
            return mean;
        }
        for row in descriptors.iter_rows() {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        let n = descriptors.rows() as f32;
        mean.iter_mut().for_each(|m| *m /= n);
        mean
    }

    /// Hash one descriptor after subtracting `mean`
    pub fn hash_one(&self, descriptor: &[f32], mean: &[f32]) -> HashedDescriptor {
        let centered: Vec<f32> = descriptor.iter().zip(mean).map(|(v, m)| v - m).collect();
        let project = |row: &[f32]| -> bool { row.iter().zip(&centered).map(|(a, b)| a * b).sum::<f32>() > 0.0 };

        let mut hash_code = vec![0u64; self.dim.div_ceil(64)];
        for (i, row) in self.primary.chunks_exact(self.dim).enumerate() {
            if project(row) {
                hash_code[i / 64] |= 1u64 << (i % 64);
            }
        }

        let mut bucket_ids = [0u16; BUCKET_GROUPS];
        for (id, matrix) in bucket_ids.iter_mut().zip(&self.secondary) {
            for row in matrix.chunks_exact(self.dim) {
                *id = (*id << 1) + project(row) as u16;
            }
        }
        HashedDescriptor { hash_code, bucket_ids }
    }

    /// Hash every row and build the bucket index
    pub fn hash(&self, descriptors: &Descriptors<f32>, mean: &[f32]) -> MatchResult<HashedDescriptors> {
        self.check_dim(descriptors.cols())?;
        let hashed: Vec<HashedDescriptor> = descriptors.iter_rows().map(|row| self.hash_one(row, mean)).collect();

        let mut buckets = vec![vec![Vec::new(); BUCKETS_PER_GROUP]; BUCKET_GROUPS];
        for (idx, h) in hashed.iter().enumerate() {
            for (group, &id) in h.bucket_ids.iter().enumerate() {
                buckets[group][id as usize].push(idx);
            }
        }
        Ok(HashedDescriptors { hashed, buckets })
    }

    /// `k` nearest database entries of every query, closest first.
    ///
    /// A query is skipped (empty list) when its buckets hold at most `k`
    /// entries counting repeats across groups, or when fewer than `k`
    /// distinct candidates survive.
    pub fn knn(
        &self,
        database: &HashedDescriptors,
        database_descriptors: &Descriptors<f32>,
        query: &HashedDescriptors,
        query_descriptors: &Descriptors<f32>,
        k: usize,
    ) -> Vec<Vec<Match>> {
        let mut used = vec![false; database.len()];
        let mut candidates = Vec::new();

        query
            .hashed
            .iter()
            .enumerate()
            .map(|(query_idx, q)| {
                candidates.clear();
                for (group, &id) in q.bucket_ids.iter().enumerate() {
                    candidates.extend_from_slice(&database.buckets[group][id as usize]);
                }
                if candidates.len() <= k {
                    return Vec::new();
                }

                let mut by_hamming = Vec::with_capacity(candidates.len());
                for &c in &candidates {
                    if !used[c] {
                        used[c] = true;
                        by_hamming.push((hamming_words(&q.hash_code, &database.hashed[c].hash_code), c));
                    }
                }
                for &(_, c) in &by_hamming {
                    used[c] = false;
                }
                by_hamming.sort_unstable();
                by_hamming.truncate(TOP_HAMMING_CANDIDATES);

                if by_hamming.len() < k {
                    return Vec::new();
                }
                let query_row = query_descriptors.row(query_idx);
                let mut by_l2: Vec<(f32, usize)> = by_hamming
                    .iter()
                    .map(|&(_, c)| (l2(query_row, database_descriptors.row(c)), c))
                    .collect();
                by_l2.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                by_l2
                    .into_iter()
                    .take(k)
                    .map(|(distance, train_idx)| Match::new(query_idx, train_idx, distance))
                    .collect()
            })
            .collect()
    }

    fn check_dim(&self, cols: usize) -> MatchResult<()> {
        if cols != self.dim {
            return Err(MatchError::DimensionMismatch { query: cols, train: self.dim });
        }
        Ok(())
    }
}

/// Ratio-tested cascade-hashing matcher over a shared hasher
#[derive(Debug, Clone)]
pub struct CascadeHashingMatcher {
    hasher: Arc<CascadeHasher>,
    ratio: f32,
}

impl CascadeHashingMatcher {
    pub const NEIGHBOURS: usize = 2;

    pub fn new(hasher: Arc<CascadeHasher>, ratio: f32) -> Self {
        Self { hasher, ratio }
    }

    pub fn hasher(&self) -> &CascadeHasher {
        &self.hasher
    }

    /// `k` neighbours in `train` of every row of `query`
    pub fn knn_match(
        &self,
        query: &Descriptors<f32>,
        train: &Descriptors<f32>,
        k: usize,
    ) -> MatchResult<Vec<Vec<Match>>> {
        self.check_inputs(query, train)?;
        let mean = CascadeHasher::zero_mean(train);
        let hashed_train = self.hasher.hash(train, &mean)?;
        let hashed_query = self.hasher.hash(query, &mean)?;
        Ok(self.hasher.knn(&hashed_train, train, &hashed_query, query, k))
    }

    /// Ratio test, duplicate suppression and optional symmetric check
    pub fn match_descriptors(
        &self,
        query: &Descriptors<f32>,
        train: &Descriptors<f32>,
        cross_check: bool,
    ) -> MatchResult<Vec<Match>> {
        self.check_inputs(query, train)?;
        let mean = CascadeHasher::zero_mean(train);
        let hashed_train = self.hasher.hash(train, &mean)?;
        let hashed_query = self.hasher.hash(query, &mean)?;

        let knn = self.hasher.knn(&hashed_train, train, &hashed_query, query, Self::NEIGHBOURS);
        let mut matches = ratio_test(&knn, self.ratio);
        remove_duplicates(&mut matches);

        if cross_check && !matches.is_empty() {
            let reverse = self.hasher.knn(&hashed_query, query, &hashed_train, train, Self::NEIGHBOURS);
            let symmetric: HashSet<(usize, usize)> = reverse
                .iter()
                .flatten()
                .map(|m| (m.train_idx, m.query_idx))
                .collect();
            matches.retain(|m| symmetric.contains(&(m.query_idx, m.train_idx)));
        }
        Ok(matches)
    }

    fn check_inputs(&self, query: &Descriptors<f32>, train: &Descriptors<f32>) -> MatchResult<()> {
        if query.is_empty() || train.is_empty() {
            return Err(MatchError::EmptyDescriptors);
        }
        if query.cols() != train.cols() {
            return Err(MatchError::DimensionMismatch { query: query.cols(), train: train.cols() });
        }
        self.hasher.check_dim(query.cols())
    }
}
