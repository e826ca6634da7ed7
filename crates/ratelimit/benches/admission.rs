use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use taskforge_core::OwnerId;
use taskforge_ratelimit::{RateLimitConfig, RateLimiter, Tier};

fn principals(n: usize) -> Vec<OwnerId> {
    (0..n)
        .map(|i| format!("principal-{i}").parse().unwrap())
        .collect()
}

/// Admission on an existing bucket (read-lock + one CAS).
fn bench_hot_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_hot_bucket");
    group.throughput(Throughput::Elements(1));

    let limiter = RateLimiter::new(RateLimitConfig::default()).unwrap();
    let who: OwnerId = "bench".parse().unwrap();
    let now = Utc::now();

    group.bench_function("tasks_route_pro", |b| {
        b.iter(|| black_box(limiter.admit(black_box("/tasks/123"), &who, Tier::Pro, now)))
    });
    group.finish();
}

/// Admission spread over many principals (bucket creation + lookup).
fn bench_many_principals(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_many_principals");

    for count in [10usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let who = principals(count);
            b.iter(|| {
                let limiter = RateLimiter::new(RateLimitConfig::default()).unwrap();
                let now = Utc::now();
                for p in &who {
                    black_box(limiter.admit("/tasks", p, Tier::Free, now));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hot_bucket, bench_many_principals);
criterion_main!(benches);
