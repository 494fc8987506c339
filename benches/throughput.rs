use criterion::{criterion_group, criterion_main, Criterion};
use flowsim::{Presentation, Simulator, Stage, StageConfig};
use std::time::Duration;

fn run_pipeline(interior_stages: usize, workers: usize) {
    let mut sim = Simulator::new();
    sim.set_duration(Duration::from_millis(100));

    sim.add_stage(Stage::new(
        "generator",
        StageConfig::new().with_buffer(256).with_generator(|| 7_u64),
    ))
    .expect("add generator");

    for i in 0..interior_stages {
        sim.add_stage(Stage::new(
            format!("stage-{i}"),
            StageConfig::new()
                .with_workers(workers)
                .with_buffer(256)
                .with_worker(|item: &u64| Ok(item.wrapping_mul(31))),
        ))
        .expect("add stage");
    }

    sim.add_stage(Stage::new("sink", StageConfig::new().with_workers(workers)))
        .expect("add sink");

    sim.start(Presentation::None).expect("run pipeline");
}

fn benchmark_single_interior_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("one_stage_one_worker", |b| {
        b.iter(|| run_pipeline(1, 1));
    });
    group.finish();
}

fn benchmark_wide_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("three_stages_four_workers", |b| {
        b.iter(|| run_pipeline(3, 4));
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_single_interior_stage,
    benchmark_wide_pipeline
);
criterion_main!(benches);
