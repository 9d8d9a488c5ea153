use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{GrayImage, ImageBuffer, Luma};
use img2m_core::DetectorType;
use img2m_features::corners::{self, SegmentPattern};
use img2m_features::rootsift;
use img2m_features::{DetectorConfig, FeatureExtractor, SiftParams};

/// Benchmark image with blobs, squares and a gentle gradient
fn create_benchmark_image(width: u32, height: u32) -> GrayImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let gradient = (x as f32 / width as f32) * 40.0;
        let square = (6..20).contains(&(x % 28)) && (6..20).contains(&(y % 28));
        let ripple = ((x as f32 * 0.21).sin() * (y as f32 * 0.17).cos()) * 25.0;
        let base = if square { 170.0 } else { 60.0 };
        Luma([(base + gradient + ripple).clamp(0.0, 255.0) as u8])
    })
}

fn bench_sift_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("sift_extraction");
    group.sample_size(10);

    for &size in &[128u32, 256, 512] {
        let img = create_benchmark_image(size, size);
        for first_octave in [0, -1] {
            let params = SiftParams { first_octave, ..SiftParams::default() };
            let extractor = FeatureExtractor::new(DetectorConfig::Sift(params)).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{}x{}", size, size), format!("first_octave={}", first_octave)),
                &img,
                |b, img| b.iter(|| black_box(extractor.extract(black_box(img)).unwrap())),
            );
        }
    }
    group.finish();
}

fn bench_detectors(c: &mut Criterion) {
    let img = create_benchmark_image(256, 256);
    let mut group = c.benchmark_group("detectors_256");
    group.sample_size(10);

    for detector in DetectorType::ALL {
        if detector == DetectorType::SuperPoint {
            continue;
        }
        let extractor = FeatureExtractor::new(DetectorConfig::default_for(detector)).unwrap();
        group.bench_function(detector.name(), |b| {
            b.iter(|| black_box(extractor.extract(black_box(&img)).unwrap()))
        });
    }
    group.finish();
}

fn bench_building_blocks(c: &mut Criterion) {
    let img = create_benchmark_image(256, 256);
    let mut group = c.benchmark_group("building_blocks");

    group.bench_function("fast_9_16", |b| {
        b.iter(|| black_box(corners::detect_corners(black_box(&img), 20, SegmentPattern::FAST_9_16, true)))
    });

    let extractor = FeatureExtractor::new(DetectorConfig::default_for(DetectorType::Sift)).unwrap();
    let (_, descriptors) = extractor.extract(&img).unwrap();
    let raw = descriptors.to_f32();
    group.bench_function("root_sift", |b| {
        b.iter(|| {
            let mut d = raw.clone();
            rootsift::root_sift(&mut d);
            black_box(d)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_sift_extraction, bench_detectors, bench_building_blocks);
criterion_main!(benches);
