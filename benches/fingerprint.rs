use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ouroboros_doccache::{fingerprint, IntentTable};

const QUERIES: &[(&str, &str)] = &[
    ("short", "Rails auth"),
    ("keyword", "How to add authentication to Rails"),
    ("late_match", "what is the recommended way to structure a getting started tutorial"),
    ("fallback", "explain the lifecycle of background jobs in sidekiq workers"),
];

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    for (name, query) in QUERIES {
        group.bench_with_input(BenchmarkId::from_parameter(name), query, |b, query| {
            b.iter(|| fingerprint(black_box("rails"), black_box(Some("7.1.2")), black_box(query)))
        });
    }

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let table = IntentTable::builtin();
    c.bench_function("classify_builtin", |b| {
        b.iter(|| table.classify(black_box("configure jwt session middleware"), "express"))
    });
}

criterion_group!(benches, bench_fingerprint, bench_classify);
criterion_main!(benches);
