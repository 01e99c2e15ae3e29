//! Benchmarks for the response comparison hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use retrace::compare::{compare, flatten_json, flatten_response};
use retrace::models::{HttpResp, NoiseMap};
use std::collections::BTreeMap;

fn sample_body(users: usize) -> String {
    let users: Vec<serde_json::Value> = (0..users)
        .map(|i| {
            serde_json::json!({
                "id": format!("user-{}", i),
                "name": format!("Name {}", i),
                "active": i % 2 == 0,
                "score": i as f64 * 1.5,
                "tags": ["alpha", "beta", "gamma"],
                "address": {
                    "city": "Springfield",
                    "zip": format!("{:05}", i),
                }
            })
        })
        .collect();
    serde_json::json!({ "users": users, "total": users.len() }).to_string()
}

fn sample_response(users: usize) -> HttpResp {
    HttpResp {
        status_code: 200,
        header: BTreeMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("x-request-id".to_string(), "bench".to_string()),
        ]),
        body: sample_body(users),
        ..Default::default()
    }
}

fn bench_flatten(c: &mut Criterion) {
    let value: serde_json::Value = serde_json::from_str(&sample_body(50)).unwrap();
    c.bench_function("flatten_json_50_users", |b| {
        b.iter(|| flatten_json(black_box(&value)))
    });

    let resp = sample_response(50);
    c.bench_function("flatten_response_50_users", |b| {
        b.iter(|| flatten_response(black_box(&resp)))
    });
}

fn bench_compare(c: &mut Criterion) {
    let expected = sample_response(50);
    let actual = sample_response(50);
    let noise = NoiseMap::from([
        ("header.x-request-id".to_string(), Vec::new()),
        ("body.users.id".to_string(), vec!["^user-".to_string()]),
    ]);

    c.bench_function("compare_equal_50_users", |b| {
        b.iter(|| compare(black_box(&expected), black_box(&actual), &noise, false))
    });

    let mut diverged = sample_response(50);
    diverged.body = diverged.body.replace("Springfield", "Shelbyville");
    c.bench_function("compare_diverged_50_users", |b| {
        b.iter(|| compare(black_box(&expected), black_box(&diverged), &noise, true))
    });
}

criterion_group!(benches, bench_flatten, bench_compare);
criterion_main!(benches);
