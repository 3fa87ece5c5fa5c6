//! Router benchmarks — LinUCB scoring and update overhead.
//!
//! The bandit sits on the hot path of every race, so selection over a
//! realistic arm pool and a single bulk update should both stay well
//! under a millisecond.

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio_model_race::latency::LatencyMetrics;
use tokio_model_race::routing::{LinUcbConfig, Router};
use tokio_model_race::{LinUcbRouter, ModelId};

fn make_router(dim: usize, arms: &[ModelId]) -> LinUcbRouter {
    let mut router = LinUcbRouter::new(
        LinUcbConfig {
            dim,
            ..LinUcbConfig::default()
        },
        Arc::new(LatencyMetrics::default()),
    );
    // Warm every arm with a few rounds so scoring runs on non-trivial state.
    let ctx: Vec<f64> = (0..dim).map(|i| 1.0 / (i + 1) as f64).collect();
    let rewards: HashMap<ModelId, f64> = arms.iter().map(|m| (m.clone(), 0.5)).collect();
    for _ in 0..8 {
        router.bulk_update(&ctx, &rewards, None);
    }
    router
}

fn arms(n: usize) -> Vec<ModelId> {
    (0..n).map(|i| ModelId::new(format!("model-{i}"))).collect()
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("linucb_select");
    for &(dim, n_arms) in &[(3usize, 4usize), (27, 4), (27, 16)] {
        let pool = arms(n_arms);
        let mut router = make_router(dim, &pool);
        let ctx: Vec<f64> = (0..dim).map(|i| (i as f64 * 0.37).sin().abs()).collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("d{dim}_arms{n_arms}")),
            &(),
            |b, _| {
                b.iter(|| {
                    let ranked = router.select(black_box(&ctx), black_box(&pool), None);
                    black_box(ranked);
                })
            },
        );
    }
    group.finish();
}

fn bench_bulk_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("linucb_bulk_update");
    for &dim in &[3usize, 27] {
        let pool = arms(4);
        let mut router = make_router(dim, &pool);
        let ctx: Vec<f64> = (0..dim).map(|i| (i as f64 * 0.61).cos().abs()).collect();
        let rewards: HashMap<ModelId, f64> =
            pool.iter().map(|m| (m.clone(), 0.7)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(format!("d{dim}")), &(), |b, _| {
            b.iter(|| {
                router.bulk_update(black_box(&ctx), black_box(&rewards), None);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_select, bench_bulk_update);
criterion_main!(benches);
