//! Benchmarks: tree induction, whole-model training and forest prediction on
//! synthetic quantized data.

#[path = "common/criterion_config.rs"]
#[allow(dead_code)]
mod criterion_config;

use criterion_config::default_criterion;

use mcu_forest::io::{MemStorage, ModelPaths, SharedStorage};
use mcu_forest::repr::ThresholdTable;
use mcu_forest::training::{RfConfig, TreeBuilder, TreeParams};
use mcu_forest::{Forest, Sample, SampleStore, Trainer};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const NUM_FEATURES: usize = 16;
const NUM_LABELS: usize = 4;
const QUANT_BITS: u8 = 2;

/// Rows where the label depends on the first two features, with noise.
fn synthetic_store(storage: &SharedStorage, path: String, n: usize) -> SampleStore {
    let mut store = SampleStore::new(storage.clone(), path);
    store.init(n, NUM_FEATURES, QUANT_BITS).unwrap();
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for _ in 0..n {
        let features: Vec<u8> = (0..NUM_FEATURES).map(|_| (next() % 4) as u8).collect();
        let mut label = ((features[0] + features[1]) / 2).min(NUM_LABELS as u8 - 1);
        if next() % 20 == 0 {
            label = (next() % NUM_LABELS as u64) as u8;
        }
        store.push(&Sample::new(features, label)).unwrap();
    }
    store.release(true).unwrap();
    store
}

fn config(num_trees: u16) -> RfConfig {
    RfConfig::builder()
        .num_trees(num_trees)
        .enable_retrain(false)
        .build()
        .unwrap()
}

fn bench_build_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("component/build_tree");
    for n in [500usize, 5_000] {
        let storage = MemStorage::shared();
        let mut store = synthetic_store(&storage, format!("/tree_{n}.bin"), n);
        store.load().unwrap();
        let layout = Forest::calculate_layout(NUM_LABELS, NUM_FEATURES, 2046, QUANT_BITS);
        let thresholds = ThresholdTable::for_layout(&layout, QUANT_BITS);
        let params = TreeParams::from_config(&config(1), NUM_LABELS, NUM_FEATURES);
        let ids: Vec<u32> = (0..n as u32).collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(BenchmarkId::new("resident", n), |b| {
            b.iter(|| {
                let mut builder = TreeBuilder::new(params, layout, thresholds, 42);
                let mut range = ids.clone();
                black_box(builder.build(&mut store, 0, &mut range))
            })
        });
    }
    group.finish();
}

fn bench_build_model(c: &mut Criterion) {
    let mut group = c.benchmark_group("e2e/build_model");
    for num_trees in [5u16, 20] {
        group.bench_function(BenchmarkId::new("trees", num_trees), |b| {
            b.iter_batched(
                || {
                    let storage = MemStorage::shared();
                    let paths = ModelPaths::new("bench");
                    let base = synthetic_store(&storage, paths.base_data(), 2_000);
                    Trainer::new(base, paths, config(num_trees)).unwrap()
                },
                |mut trainer| black_box(trainer.build_model().unwrap()),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_predict(c: &mut Criterion) {
    let storage = MemStorage::shared();
    let paths = ModelPaths::new("bench_predict");
    let base = synthetic_store(&storage, paths.base_data(), 2_000);
    let mut trainer = Trainer::new(base, paths, config(20)).unwrap();
    trainer.build_model().unwrap();

    let mut queries = synthetic_store(&storage, "/queries.bin".to_string(), 1_000);
    queries.load().unwrap();
    let rows: Vec<Vec<u8>> = queries.iter().map(|s| s.features).collect();

    let mut group = c.benchmark_group("component/predict");
    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("forest_20_trees", |b| {
        b.iter(|| {
            rows.iter()
                .map(|r| trainer.forest().predict(black_box(r)) as u32)
                .sum::<u32>()
        })
    });
    group.finish();
}

criterion_group! {
    name = build_benches;
    config = default_criterion();
    targets = bench_build_tree, bench_build_model, bench_predict,
}

criterion_main!(build_benches);
