//! FLANN-style approximate nearest-neighbour indices.
//!
//! Float descriptors are searched with randomized KD-trees, a hierarchical
//! k-means tree, both at once (composite) or linearly. Binary descriptors use
//! multi-probe locality sensitive hashing. Every randomized choice draws from
//! a generator seeded by the caller, so a given pair always builds the same
//! index.

use crate::config::{FlannAlgorithm, FlannCentersInit, FlannParams};
use crate::distance::{hamming, l2_squared};
use crate::error::{MatchError, MatchResult};
use crate::knn::{KnnMatcher, TopK};
use img2m_core::{DescriptorMatrix, DescriptorType, Descriptors, DetectorType, Match};
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Number of highest-variance dimensions a KD split picks from
const RAND_DIM: usize = 5;
/// Points used to estimate split statistics
const SAMPLE_MEAN: usize = 100;

/// FLANN matcher for one image pair
#[derive(Debug, Clone)]
pub struct FlannMatcher {
    params: FlannParams,
    algorithm: FlannAlgorithm,
    seed: u64,
}

impl FlannMatcher {
    /// `params` are taken as effective; `AUTO` is resolved from `detector`
    pub fn new(params: &FlannParams, detector: DetectorType, seed: u64) -> Self {
        let params = params.effective();
        let algorithm = params.algorithm.resolve(detector);
        Self { params, algorithm, seed }
    }

    pub fn algorithm(&self) -> FlannAlgorithm {
        self.algorithm
    }

    /// Binary input is only searchable with LSH
    pub fn accepts(&self, descriptor_type: DescriptorType) -> bool {
        descriptor_type == DescriptorType::F32 || self.algorithm == FlannAlgorithm::Lsh
    }

    /// Algorithm actually used for descriptors of the given type
    pub fn index_algorithm(&self, descriptor_type: DescriptorType) -> FlannAlgorithm {
        match (self.algorithm, descriptor_type) {
            (FlannAlgorithm::Lsh, DescriptorType::F32) => FlannAlgorithm::KdTree,
            (algorithm, _) => algorithm,
        }
    }

    fn neighbours(&self, k: usize) -> usize {
        if self.params.max_neighbors > 0 {
            k.min(self.params.max_neighbors as usize)
        } else {
            k
        }
    }
}

impl KnnMatcher for FlannMatcher {
    fn knn_match(&self, query: &DescriptorMatrix, train: &DescriptorMatrix, k: usize) -> MatchResult<Vec<Vec<Match>>> {
        if query.is_empty() || train.is_empty() {
            return Err(MatchError::EmptyDescriptors);
        }
        if query.cols() != train.cols() {
            return Err(MatchError::DimensionMismatch { query: query.cols(), train: train.cols() });
        }
        let k = self.neighbours(k);
        let mut rng = Pcg64::seed_from_u64(self.seed);

        match (query, train) {
            (DescriptorMatrix::Binary(q), DescriptorMatrix::Binary(t)) if self.algorithm == FlannAlgorithm::Lsh => {
                let index = LshIndex::build(t, &self.params, &mut rng);
                Ok(search_all(q.rows(), |i| index.search(q.row(i), k).into_matches(i)))
            }
            (DescriptorMatrix::Float(q), DescriptorMatrix::Float(t)) => {
                let index = FloatIndex::build(self.index_algorithm(DescriptorType::F32), t, &self.params, &mut rng);
                Ok(search_all(q.rows(), |i| index.search(i, q.row(i), k, &self.params)))
            }
            _ => Err(MatchError::IncompatibleDescriptors {
                backend: "FLANN",
                required: DescriptorType::F32,
                found: if query.descriptor_type() == DescriptorType::F32 {
                    train.descriptor_type()
                } else {
                    query.descriptor_type()
                },
            }),
        }
    }
}

fn search_all<F>(rows: usize, search: F) -> Vec<Vec<Match>>
where
    F: Fn(usize) -> Vec<Match> + Sync + Send,
{
    (0..rows).into_par_iter().map(search).collect()
}

/// Unexplored branch ordered as a min-heap on its lower bound
struct Branch<'a, N> {
    bound: f32,
    node: &'a N,
}

impl<N> Ord for Branch<'_, N> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.bound.total_cmp(&self.bound)
    }
}

impl<N> PartialOrd for Branch<'_, N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<N> PartialEq for Branch<'_, N> {
    fn eq(&self, other: &Self) -> bool {
        self.bound == other.bound
    }
}

impl<N> Eq for Branch<'_, N> {}

/// Per-query bookkeeping shared by the tree searches
struct SearchState {
    top: TopK,
    visited: Vec<bool>,
    checks: usize,
    max_checks: usize,
    /// Squared `(1 + eps)`
    eps_factor: f32,
}

impl SearchState {
    fn new(k: usize, points: usize, params: &FlannParams) -> Self {
        Self {
            top: TopK::new(k),
            visited: vec![false; points],
            checks: 0,
            max_checks: params.checks,
            eps_factor: (1.0 + params.eps) * (1.0 + params.eps),
        }
    }

    fn check(&mut self, data: &Descriptors<f32>, query: &[f32], index: usize) {
        if std::mem::replace(&mut self.visited[index], true) {
            return;
        }
        self.checks += 1;
        let d = l2_squared(query, data.row(index));
        if d <= self.top.worst() {
            self.top.push(d, index);
        }
    }

    fn exhausted(&self) -> bool {
        self.checks >= self.max_checks && self.top.len() == self.top.capacity()
    }

    fn worth_visiting(&self, bound: f32) -> bool {
        bound * self.eps_factor < self.top.worst()
    }

    fn into_matches(self, query_idx: usize) -> Vec<Match> {
        self.top
            .into_matches(query_idx)
            .into_iter()
            .map(|m| Match::new(m.query_idx, m.train_idx, m.distance.sqrt()))
            .collect()
    }
}

enum FloatIndex<'a> {
    KdTree(KdForest<'a>),
    KMeans(KMeansTree<'a>),
    Composite(KdForest<'a>, KMeansTree<'a>),
    Linear(&'a Descriptors<f32>),
}

impl<'a> FloatIndex<'a> {
    fn build(algorithm: FlannAlgorithm, data: &'a Descriptors<f32>, params: &FlannParams, rng: &mut Pcg64) -> Self {
        match algorithm {
            FlannAlgorithm::KMeans => FloatIndex::KMeans(KMeansTree::build(data, params, rng)),
            FlannAlgorithm::Composite => {
                let forest = KdForest::build(data, params.trees, rng);
                FloatIndex::Composite(forest, KMeansTree::build(data, params, rng))
            }
            FlannAlgorithm::Linear => FloatIndex::Linear(data),
            _ => FloatIndex::KdTree(KdForest::build(data, params.trees, rng)),
        }
    }

    fn search(&self, query_idx: usize, query: &[f32], k: usize, params: &FlannParams) -> Vec<Match> {
        match self {
            FloatIndex::KdTree(forest) => {
                let mut state = SearchState::new(k, forest.data.rows(), params);
                forest.search(query, &mut state);
                state.into_matches(query_idx)
            }
            FloatIndex::KMeans(tree) => {
                let mut state = SearchState::new(k, tree.data.rows(), params);
                tree.search(query, &mut state);
                state.into_matches(query_idx)
            }
            FloatIndex::Composite(forest, tree) => {
                let mut state = SearchState::new(k, forest.data.rows(), params);
                forest.search(query, &mut state);
                state.checks = 0;
                tree.search(query, &mut state);
                state.into_matches(query_idx)
            }
            FloatIndex::Linear(data) => {
                let mut state = SearchState::new(k, data.rows(), params);
                for i in 0..data.rows() {
                    state.check(data, query, i);
                }
                state.into_matches(query_idx)
            }
        }
    }
}

enum KdNode {
    Leaf(usize),
    Bucket(Vec<usize>),
    Split {
        dim: usize,
        value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

/// Randomized KD-trees searched best-bin-first
struct KdForest<'a> {
    data: &'a Descriptors<f32>,
    trees: Vec<KdNode>,
}

impl<'a> KdForest<'a> {
    fn build(data: &'a Descriptors<f32>, trees: usize, rng: &mut Pcg64) -> Self {
        let trees = (0..trees.max(1))
            .map(|_| {
                let mut indices: Vec<usize> = (0..data.rows()).collect();
                indices.shuffle(rng);
                Self::build_node(data, indices, rng)
            })
            .collect();
        Self { data, trees }
    }

    fn build_node(data: &Descriptors<f32>, indices: Vec<usize>, rng: &mut Pcg64) -> KdNode {
        if indices.len() == 1 {
            return KdNode::Leaf(indices[0]);
        }
        let (dim, value) = Self::choose_split(data, &indices, rng);
        let (left, right): (Vec<usize>, Vec<usize>) = indices.iter().partition(|&&i| data.row(i)[dim] < value);
        if left.is_empty() || right.is_empty() {
            return KdNode::Bucket(indices);
        }
        KdNode::Split {
            dim,
            value,
            left: Box::new(Self::build_node(data, left, rng)),
            right: Box::new(Self::build_node(data, right, rng)),
        }
    }

    /// Random dimension among the highest-variance ones, split at its mean
    fn choose_split(data: &Descriptors<f32>, indices: &[usize], rng: &mut Pcg64) -> (usize, f32) {
        let sample = &indices[..indices.len().min(SAMPLE_MEAN)];
        let n = sample.len() as f32;
        let cols = data.cols();
        let mut mean = vec![0.0f32; cols];
        for &i in sample {
            for (m, v) in mean.iter_mut().zip(data.row(i)) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut variance = vec![0.0f32; cols];
        for &i in sample {
            for ((var, v), m) in variance.iter_mut().zip(data.row(i)).zip(&mean) {
                *var += (v - m) * (v - m);
            }
        }

        let mut dims: Vec<usize> = (0..cols).collect();
        dims.sort_by(|&a, &b| variance[b].total_cmp(&variance[a]).then(a.cmp(&b)));
        let dim = dims[rng.gen_range(0..RAND_DIM.min(cols))];
        (dim, mean[dim])
    }

    fn search(&self, query: &[f32], state: &mut SearchState) {
        let mut heap = BinaryHeap::new();
        for tree in &self.trees {
            self.descend(tree, 0.0, query, state, &mut heap);
        }
        while let Some(branch) = heap.pop() {
            if state.exhausted() || !state.worth_visiting(branch.bound) {
                break;
            }
            self.descend(branch.node, branch.bound, query, state, &mut heap);
        }
    }

    fn descend<'n>(
        &self,
        mut node: &'n KdNode,
        bound: f32,
        query: &[f32],
        state: &mut SearchState,
        heap: &mut BinaryHeap<Branch<'n, KdNode>>,
    ) {
        loop {
            match node {
                KdNode::Leaf(i) => return state.check(self.data, query, *i),
                KdNode::Bucket(indices) => {
                    for &i in indices {
                        state.check(self.data, query, i);
                    }
                    return;
                }
                KdNode::Split { dim, value, left, right } => {
                    let diff = query[*dim] - value;
                    let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                    let far_bound = bound.max(diff * diff);
                    if state.worth_visiting(far_bound) {
                        heap.push(Branch { bound: far_bound, node: far.as_ref() });
                    }
                    node = near.as_ref();
                }
            }
        }
    }
}

enum KMeansContent {
    Points(Vec<usize>),
    Children(Vec<KMeansNode>),
}

struct KMeansNode {
    center: Vec<f32>,
    content: KMeansContent,
}

/// Hierarchical k-means tree searched best-bin-first
struct KMeansTree<'a> {
    data: &'a Descriptors<f32>,
    root: KMeansNode,
}

impl<'a> KMeansTree<'a> {
    fn build(data: &'a Descriptors<f32>, params: &FlannParams, rng: &mut Pcg64) -> Self {
        let indices: Vec<usize> = (0..data.rows()).collect();
        let center = mean_of(data, &indices);
        let root = Self::build_node(data, indices, center, params, rng);
        Self { data, root }
    }

    fn build_node(
        data: &Descriptors<f32>,
        indices: Vec<usize>,
        center: Vec<f32>,
        params: &FlannParams,
        rng: &mut Pcg64,
    ) -> KMeansNode {
        if indices.len() <= params.branching {
            return KMeansNode { center, content: KMeansContent::Points(indices) };
        }

        let mut centers = initial_centers(data, &indices, params.branching, params.centers_init, rng);
        let mut assignment = vec![usize::MAX; indices.len()];
        for _ in 0..params.iterations.max(1) {
            let mut changed = false;
            for (slot, &i) in assignment.iter_mut().zip(&indices) {
                let nearest = nearest_center(&centers, data.row(i));
                if *slot != nearest {
                    *slot = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            for (c, center) in centers.iter_mut().enumerate() {
                let members: Vec<usize> = indices
                    .iter()
                    .zip(&assignment)
                    .filter(|&(_, &a)| a == c)
                    .map(|(&i, _)| i)
                    .collect();
                if !members.is_empty() {
                    *center = mean_of(data, &members);
                }
            }
        }

        let mut groups = vec![Vec::new(); centers.len()];
        for (&i, &a) in indices.iter().zip(&assignment) {
            groups[a].push(i);
        }
        if groups.iter().filter(|g| !g.is_empty()).count() < 2 {
            return KMeansNode { center, content: KMeansContent::Points(indices) };
        }

        let children = groups
            .into_iter()
            .zip(centers)
            .filter(|(g, _)| !g.is_empty())
            .map(|(g, c)| Self::build_node(data, g, c, params, rng))
            .collect();
        KMeansNode { center, content: KMeansContent::Children(children) }
    }

    fn search(&self, query: &[f32], state: &mut SearchState) {
        let mut heap = BinaryHeap::new();
        self.descend(&self.root, query, state, &mut heap);
        while let Some(branch) = heap.pop() {
            if state.exhausted() {
                break;
            }
            self.descend(branch.node, query, state, &mut heap);
        }
    }

    fn descend<'n>(
        &self,
        mut node: &'n KMeansNode,
        query: &[f32],
        state: &mut SearchState,
        heap: &mut BinaryHeap<Branch<'n, KMeansNode>>,
    ) {
        loop {
            match &node.content {
                KMeansContent::Points(indices) => {
                    for &i in indices {
                        state.check(self.data, query, i);
                    }
                    return;
                }
                KMeansContent::Children(children) => {
                    let distances: Vec<f32> = children.iter().map(|c| l2_squared(query, &c.center)).collect();
                    let best = argmin(&distances);
                    for (c, (child, &d)) in children.iter().zip(&distances).enumerate() {
                        if c != best {
                            heap.push(Branch { bound: d, node: child });
                        }
                    }
                    node = &children[best];
                }
            }
        }
    }
}

fn argmin(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1).then(a.0.cmp(&b.0)))
        .map_or(0, |(i, _)| i)
}

fn nearest_center(centers: &[Vec<f32>], point: &[f32]) -> usize {
    let distances: Vec<f32> = centers.iter().map(|c| l2_squared(point, c)).collect();
    argmin(&distances)
}

fn mean_of(data: &Descriptors<f32>, indices: &[usize]) -> Vec<f32> {
    let mut mean = vec![0.0f32; data.cols()];
    for &i in indices {
        for (m, v) in mean.iter_mut().zip(data.row(i)) {
            *m += v;
        }
    }
    let n = indices.len().max(1) as f32;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

fn initial_centers(
    data: &Descriptors<f32>,
    indices: &[usize],
    branching: usize,
    init: FlannCentersInit,
    rng: &mut Pcg64,
) -> Vec<Vec<f32>> {
    let n = indices.len();
    let k = branching.min(n);
    let chosen: Vec<usize> = match init {
        FlannCentersInit::Random => index::sample(rng, n, k).into_iter().collect(),
        FlannCentersInit::Gonzales => {
            let mut chosen = vec![rng.gen_range(0..n)];
            let mut closest: Vec<f32> = (0..n)
                .map(|p| l2_squared(data.row(indices[p]), data.row(indices[chosen[0]])))
                .collect();
            while chosen.len() < k {
                let far = (0..n)
                    .max_by(|&a, &b| closest[a].total_cmp(&closest[b]).then(b.cmp(&a)))
                    .unwrap_or(0);
                if closest[far] <= 0.0 {
                    break;
                }
                chosen.push(far);
                update_closest(data, indices, far, &mut closest);
            }
            chosen
        }
        FlannCentersInit::KMeansPP => {
            let mut chosen = vec![rng.gen_range(0..n)];
            let mut closest: Vec<f32> = (0..n)
                .map(|p| l2_squared(data.row(indices[p]), data.row(indices[chosen[0]])))
                .collect();
            while chosen.len() < k {
                let total: f32 = closest.iter().sum();
                if total <= 0.0 {
                    break;
                }
                let mut target = rng.gen_range(0.0..total);
                let mut pick = n - 1;
                for (p, &d) in closest.iter().enumerate() {
                    if target < d {
                        pick = p;
                        break;
                    }
                    target -= d;
                }
                chosen.push(pick);
                update_closest(data, indices, pick, &mut closest);
            }
            chosen
        }
    };
    chosen.into_iter().map(|p| data.row(indices[p]).to_vec()).collect()
}

fn update_closest(data: &Descriptors<f32>, indices: &[usize], center: usize, closest: &mut [f32]) {
    let c = data.row(indices[center]);
    for (p, d) in closest.iter_mut().enumerate() {
        *d = d.min(l2_squared(data.row(indices[p]), c));
    }
}

struct LshTable {
    /// Descriptor bit positions forming the key, lowest key bit first
    bits: Vec<usize>,
    buckets: HashMap<u64, Vec<usize>>,
}

impl LshTable {
    fn key(&self, descriptor: &[u8]) -> u64 {
        self.bits.iter().enumerate().fold(0u64, |key, (j, &bit)| {
            key | ((((descriptor[bit / 8] >> (bit % 8)) & 1) as u64) << j)
        })
    }
}

/// Multi-probe LSH over binary descriptors
struct LshIndex<'a> {
    data: &'a Descriptors<u8>,
    tables: Vec<LshTable>,
    probes: Vec<u64>,
}

impl<'a> LshIndex<'a> {
    fn build(data: &'a Descriptors<u8>, params: &FlannParams, rng: &mut Pcg64) -> Self {
        let total_bits = data.cols() * 8;
        let key_size = params.key_size.min(total_bits).min(64);
        let tables = (0..params.table_number)
            .map(|_| {
                let mut all: Vec<usize> = (0..total_bits).collect();
                all.shuffle(rng);
                all.truncate(key_size);
                let mut table = LshTable { bits: all, buckets: HashMap::new() };
                for (i, row) in data.iter_rows().enumerate() {
                    let key = table.key(row);
                    table.buckets.entry(key).or_default().push(i);
                }
                table
            })
            .collect();
        Self {
            data,
            tables,
            probes: probe_masks(key_size, params.multi_probe_level),
        }
    }

    fn search(&self, query: &[u8], k: usize) -> TopK {
        let mut top = TopK::new(k);
        let mut visited = vec![false; self.data.rows()];
        for table in &self.tables {
            let key = table.key(query);
            for mask in &self.probes {
                let Some(bucket) = table.buckets.get(&(key ^ mask)) else {
                    continue;
                };
                for &i in bucket {
                    if !std::mem::replace(&mut visited[i], true) {
                        let d = hamming(query, self.data.row(i)) as f32;
                        if d <= top.worst() {
                            top.push(d, i);
                        }
                    }
                }
            }
        }
        top
    }
}

/// XOR masks flipping up to `level` of the `key_size` key bits
fn probe_masks(key_size: usize, level: usize) -> Vec<u64> {
    let mut masks = vec![0u64];
    let mut frontier = vec![(0u64, 0usize)];
    for _ in 0..level {
        let mut next = Vec::new();
        for &(mask, start) in &frontier {
            for bit in start..key_size {
                let m = mask | (1u64 << bit);
                masks.push(m);
                next.push((m, bit + 1));
            }
        }
        frontier = next;
    }
    masks
}
