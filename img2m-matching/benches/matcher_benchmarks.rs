use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use img2m_core::{DescriptorMatrix, Descriptors, DetectorType};
use img2m_matching::{CascadeHasher, MatcherConfig, MatcherDispatcher, MatcherType};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// Train set plus a slightly perturbed copy used as queries
fn create_benchmark_descriptors(rows: usize, cols: usize) -> (DescriptorMatrix, DescriptorMatrix) {
    let mut rng = Pcg64::seed_from_u64(2024);
    let train: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(0.0f32..0.2)).collect();
    let query: Vec<f32> = train.iter().map(|v| v + rng.gen_range(-0.01f32..0.01)).collect();
    (
        Descriptors::from_vec(rows, cols, query).unwrap().into(),
        Descriptors::from_vec(rows, cols, train).unwrap().into(),
    )
}

fn create_binary_descriptors(rows: usize) -> (DescriptorMatrix, DescriptorMatrix) {
    let mut rng = Pcg64::seed_from_u64(7);
    let train: Vec<u8> = (0..rows * 32).map(|_| rng.gen()).collect();
    let mut query = train.clone();
    for row in query.chunks_mut(32) {
        row[rng.gen_range(0..32)] ^= 1 << rng.gen_range(0..8);
    }
    (
        Descriptors::from_vec(rows, 32, query).unwrap().into(),
        Descriptors::from_vec(rows, 32, train).unwrap().into(),
    )
}

fn bench_float_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("sift_like_matching");
    group.sample_size(10);

    for &rows in &[500usize, 2000] {
        let (query, train) = create_benchmark_descriptors(rows, 128);
        for matcher_type in [MatcherType::CascadeHashingL2, MatcherType::Flann, MatcherType::BruteForceL2] {
            let dispatcher = MatcherDispatcher::new(MatcherConfig::with_matcher(matcher_type), DetectorType::Sift).unwrap();
            group.bench_with_input(
                BenchmarkId::new(matcher_type.config_name(), rows),
                &(&query, &train),
                |b, (q, t)| b.iter(|| black_box(dispatcher.match_descriptors(q, t, 12345).unwrap())),
            );
        }
    }
    group.finish();
}

fn bench_binary_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("orb_like_matching");
    group.sample_size(10);

    let (query, train) = create_binary_descriptors(2000);
    for matcher_type in [MatcherType::Flann, MatcherType::BruteForceHamming] {
        let dispatcher = MatcherDispatcher::new(MatcherConfig::with_matcher(matcher_type), DetectorType::Orb).unwrap();
        group.bench_function(matcher_type.config_name(), |b| {
            b.iter(|| black_box(dispatcher.match_descriptors(&query, &train, 12345).unwrap()))
        });
    }
    group.finish();
}

fn bench_cascade_hashing(c: &mut Criterion) {
    let (_, train) = create_benchmark_descriptors(2000, 128);
    let train = train.to_f32();
    let hasher = CascadeHasher::new(128);
    let mean = CascadeHasher::zero_mean(&train);

    c.bench_function("cascade_projection_init_128", |b| b.iter(|| black_box(CascadeHasher::new(black_box(128)))));
    c.bench_function("cascade_hash_2000x128", |b| b.iter(|| black_box(hasher.hash(&train, &mean).unwrap())));
}

criterion_group!(benches, bench_float_backends, bench_binary_backends, bench_cascade_hashing);
criterion_main!(benches);
