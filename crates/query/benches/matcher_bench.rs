//! Benchmarks for selector matching and sorted query execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use livedata_core::value::to_document;
use livedata_core::Document;
use livedata_query::{CursorDescription, Matcher};
use serde_json::json;

fn create_docs(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            to_document(json!({
                "_id": format!("doc{}", i),
                "status": if i % 3 == 0 { "open" } else { "closed" },
                "votes": (i * 7919) % 101,
                "tags": ["a", format!("t{}", i % 10)],
                "meta": {"owner": format!("u{}", i % 25)}
            }))
            .unwrap()
        })
        .collect()
}

fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");
    let matcher = Matcher::new(&json!({
        "status": "open",
        "votes": {"$gte": 20, "$lt": 80},
        "tags": "t3",
        "meta.owner": {"$in": ["u1", "u3", "u5"]}
    }))
    .unwrap();

    for size in [100, 1000, 10000] {
        let docs = create_docs(size);
        group.bench_with_input(BenchmarkId::new("document_matches", size), &docs, |b, docs| {
            b.iter(|| docs.iter().filter(|d| matcher.document_matches(black_box(d))).count())
        });
    }
    group.finish();
}

fn bench_sorted_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorted_query");
    let cursor = CursorDescription::new("docs", json!({"status": "open"}))
        .with_sort(json!({"votes": -1}))
        .with_limit(20)
        .compile()
        .unwrap();

    for size in [100, 1000, 10000] {
        let docs = create_docs(size);
        group.bench_with_input(BenchmarkId::new("execute", size), &docs, |b, docs| {
            b.iter(|| cursor.execute(black_box(docs.iter())))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_matcher, bench_sorted_query);
criterion_main!(benches);
