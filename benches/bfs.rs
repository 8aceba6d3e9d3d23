use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use gale::{
    test_utils::{random_directed, BfsProgram},
    EdgeDir, GraphConfig, GraphEngine,
};

fn bfs_throughput(c: &mut Criterion) {
    let builder = random_directed(10_000, 8, 42);
    c.bench_function("bfs_10k_avg_deg_8", |b| {
        b.iter(|| {
            let (factory, index) = builder.build_fixture();
            let mut engine = GraphEngine::new(
                GraphConfig::default(),
                Arc::new(factory),
                index,
                BfsProgram::new(EdgeDir::Out),
            )
            .expect("engine construction");
            engine.start(&[0]).expect("start");
            engine.wait_for_completion().expect("completion")
        })
    });
}

criterion_group!(benches, bfs_throughput);
criterion_main!(benches);
