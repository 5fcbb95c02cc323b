//! Pattern matching benchmarks
//!
//! Brute-force matching versus the translated document filter, and the
//! cost of a full `find_experiments` scan per adapter:
//! - `matches` over N experiment views
//! - `Filter::from_pattern` + `Filter::matches` over the same views
//! - document vs relational `find_experiments`
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use protos_db::docstore::{Filter, MemoryServer};
use protos_db::pattern::matches;
use protos_db::storage::{DocumentStore, StorageAdapter};
use protos_db::Metadata;
use serde_json::{json, Value};

/// Experiment views with a handful of users, tags and nested run settings
fn create_views(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "metadata": {
                    "id": format!("x{i}"),
                    "name": "scan",
                    "user": format!("user_{}", i % 10),
                    "tags": ["night", format!("batch_{}", i % 7)],
                    "run": {"n": i % 5, "gain": 0.5},
                }
            })
        })
        .collect()
}

fn query() -> Value {
    json!({"metadata": {"user": "user_3", "tags": ["batch_3"], "run": {"n": 3}}})
}

/// Benchmark brute-force structural matching
fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");
    let pattern = query();

    for size in [1_000, 10_000, 100_000].iter() {
        let views = create_views(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let hits = views.iter().filter(|v| matches(&pattern, v)).count();
                black_box(hits);
            });
        });
    }

    group.finish();
}

/// Benchmark the translated filter over the same views
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let filter = Filter::from_pattern(&query());

    for size in [1_000, 10_000, 100_000].iter() {
        let views = create_views(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let hits = views.iter().filter(|v| filter.matches(v)).count();
                black_box(hits);
            });
        });
    }

    group.finish();
}

/// Benchmark pattern translation itself
fn bench_translation(c: &mut Criterion) {
    let pattern = query();
    c.bench_function("filter_from_pattern", |b| {
        b.iter(|| black_box(Filter::from_pattern(black_box(&pattern))));
    });
}

fn seed(storage: &mut dyn StorageAdapter, views: &[Value]) {
    for view in views {
        let xid = storage.create_experiment_id("scan").unwrap();
        let mut md: Metadata = view["metadata"].as_object().cloned().unwrap_or_default();
        md.insert("id".to_string(), json!(xid));
        storage.write_experiment_metadata(&md, &xid).unwrap();
    }
}

/// Benchmark `find_experiments` end to end per adapter
fn bench_find_experiments(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_experiments");
    let pattern = query();

    for size in [100, 1_000].iter() {
        let views = create_views(*size);

        let mut document = DocumentStore::new(MemoryServer::new().connect().unwrap(), "bench");
        seed(&mut document, &views);
        group.bench_with_input(BenchmarkId::new("document", size), size, |b, _| {
            b.iter(|| black_box(document.find_experiments(&pattern).unwrap()));
        });

        #[cfg(feature = "relational")]
        {
            let mut relational =
                protos_db::storage::RelationalStore::open(":memory:", "bench").unwrap();
            seed(&mut relational, &views);
            group.bench_with_input(BenchmarkId::new("relational", size), size, |b, _| {
                b.iter(|| black_box(relational.find_experiments(&pattern).unwrap()));
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_matcher,
    bench_filter,
    bench_translation,
    bench_find_experiments
);
criterion_main!(benches);
