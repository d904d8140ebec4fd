use criterion::{Criterion, criterion_group, criterion_main};
use common::RetrievalResult;
use search_core::{FusionStrategy, MinMaxFusion, rrf_fuse};

fn bench_fusion(c: &mut Criterion) {
    let sparse_ids = (0..100).map(|i| format!("c{i}")).collect::<Vec<_>>();
    let dense_ids = (0..100).rev().map(|i| format!("c{i}")).collect::<Vec<_>>();
    #[allow(clippy::cast_precision_loss)]
    let sparse = RetrievalResult::from_sorted(
        sparse_ids.iter().enumerate().map(|(i, id)| (id.clone(), 100.0 - i as f32)),
    );
    #[allow(clippy::cast_precision_loss)]
    let dense = RetrievalResult::from_sorted(
        dense_ids.iter().enumerate().map(|(i, id)| (id.clone(), 1.0 - i as f32 / 100.0)),
    );
    let min_max = MinMaxFusion::new(0.5);

    c.bench_function("rrf_fuse_100", |b| {
        b.iter(|| {
            let _ = rrf_fuse(&sparse_ids, &dense_ids, 60, 1.0, 0.7);
        })
    });
    c.bench_function("min_max_fuse_100", |b| {
        b.iter(|| {
            let _ = min_max.fuse(&sparse, &dense);
        })
    });
}

criterion_group!(benches, bench_fusion);
criterion_main!(benches);
