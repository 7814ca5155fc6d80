use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use patchflow_core::{JobId, RunId, TenantId};
use patchflow_infra::admission::{AdmissionController, AdmissionPolicy, InMemoryAdmissionController, PlanTier};
use patchflow_infra::idempotency::{IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore};
use patchflow_infra::jobs::{InMemoryJobStore, JobEnvelope, JobStore, JobType, WorkerId};
use serde_json::json;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn filled_store(count: usize, ordering_keys: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let tenant_id = TenantId::new();
    let now = Utc::now();
    for i in 0..count {
        let mut envelope = JobEnvelope::new(tenant_id, RunId::new(), JobType::Notify, json!({"event": "bench"}))
            .with_priority((i % 3) as i32);
        if ordering_keys > 0 {
            envelope = envelope.with_ordering_key(format!("key-{}", i % ordering_keys));
        }
        store.enqueue(envelope, now).unwrap();
    }
    store
}

/// Claim and complete every job in a queue of `size`.
fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_throughput");

    for size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("claim_complete", size), size, |b, &size| {
            let worker = WorkerId::new("bench");
            b.iter_batched(
                || filled_store(size, 0),
                |store| {
                    let now = Utc::now();
                    while let Some(claimed) = store.claim(&worker, LEASE, None, now).unwrap() {
                        let id = claimed.job.id();
                        store.start(id, &worker, now).unwrap();
                        black_box(store.complete(id, &worker, json!({}), now).unwrap());
                    }
                },
                BatchSize::SmallInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("claim_complete_ordered", size), size, |b, &size| {
            let worker = WorkerId::new("bench");
            b.iter_batched(
                || filled_store(size, 8),
                |store| {
                    let now = Utc::now();
                    while let Some(claimed) = store.claim(&worker, LEASE, None, now).unwrap() {
                        let id = claimed.job.id();
                        store.start(id, &worker, now).unwrap();
                        black_box(store.complete(id, &worker, json!({}), now).unwrap());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    group.sample_size(1000);

    group.bench_function("admit_release", |b| {
        let controller = InMemoryAdmissionController::new(AdmissionPolicy::default());
        let tenant_id = TenantId::new();
        controller.set_plan(tenant_id, PlanTier::Enterprise).unwrap();
        b.iter(|| {
            let holder = JobId::new();
            black_box(controller.try_admit(tenant_id, holder).unwrap());
            controller.release(tenant_id, holder).unwrap();
        });
    });

    group.bench_function("reject_at_limit", |b| {
        let controller = InMemoryAdmissionController::new(AdmissionPolicy::default());
        let tenant_id = TenantId::new();
        controller.try_admit(tenant_id, JobId::new()).unwrap();
        b.iter(|| black_box(controller.try_admit(tenant_id, JobId::new()).unwrap()));
    });

    group.finish();
}

fn bench_idempotency(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency");

    group.bench_function("begin_finish_fresh_key", |b| {
        let store = InMemoryIdempotencyStore::new();
        let tenant_id = TenantId::new();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let key = IdempotencyKey::new(tenant_id, "start-run", format!("k{n}")).unwrap();
            let now = Utc::now();
            black_box(store.begin_or_join(&key, "bench", LEASE, now).unwrap());
            store.finish(&key, "bench", json!({"ok": true}), now).unwrap();
        });
    });

    group.bench_function("cached_duplicate", |b| {
        let store = InMemoryIdempotencyStore::new();
        let key = IdempotencyKey::new(TenantId::new(), "start-run", "k1").unwrap();
        store.begin_or_join(&key, "first", LEASE, Utc::now()).unwrap();
        store.finish(&key, "first", json!({"ok": true}), Utc::now()).unwrap();
        b.iter(|| black_box(store.begin_or_join(&key, "dup", LEASE, Utc::now()).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_claim_throughput, bench_admission, bench_idempotency);
criterion_main!(benches);
