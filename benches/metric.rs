use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use vidsim::bitmap::PairBitmap;
use vidsim::metric::{Avx2Backend, BatchBackend, ScalarBackend};
use vidsim::{MetricBackend, Miniature};

fn random_miniature(id: u64, rng: &mut StdRng) -> Miniature {
    let n = 32 * 32;
    let mut plane = || {
        let mut v = vec![0u8; n];
        rng.fill_bytes(&mut v);
        v
    };
    let (r, g, b) = (plane(), plane(), plane());
    Miniature::from_planes(id, 32, 32, r, g, b).unwrap()
}

fn bench_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("Score");
    let mut rng = StdRng::seed_from_u64(1);
    let a = random_miniature(0, &mut rng);
    let b = random_miniature(1, &mut rng);

    group.throughput(Throughput::Elements(a.pixel_count() as u64));
    group.bench_function("scalar", |bch| {
        bch.iter(|| ScalarBackend.score(black_box(&a), black_box(&b)).unwrap());
    });
    group.bench_function("batch", |bch| {
        bch.iter(|| BatchBackend.score(black_box(&a), black_box(&b)).unwrap());
    });
    if let Ok(avx2) = Avx2Backend::new() {
        group.bench_function("avx2", |bch| {
            bch.iter(|| avx2.score(black_box(&a), black_box(&b)).unwrap());
        });
    }
    group.finish();
}

fn bench_compare_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compare batch");
    let mut rng = StdRng::seed_from_u64(2);
    let minis: Vec<Miniature> = (0..64).map(|id| random_miniature(id, &mut rng)).collect();
    let pairs: Vec<(u32, u32)> =
        (0..64u32).flat_map(|a| (a + 1..64).map(move |b| (a, b))).collect();

    group.throughput(Throughput::Elements(pairs.len() as u64));
    group.bench_function("batch", |bch| {
        bch.iter(|| {
            let out = PairBitmap::new(minis.len());
            BatchBackend.compare_batch(&minis, &pairs, 0.9, &out).unwrap();
            out.count()
        });
    });
    if let Ok(avx2) = Avx2Backend::new() {
        group.bench_function("avx2", |bch| {
            bch.iter(|| {
                let out = PairBitmap::new(minis.len());
                avx2.compare_batch(&minis, &pairs, 0.9, &out).unwrap();
                out.count()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_score, bench_compare_batch);
criterion_main!(benches);
