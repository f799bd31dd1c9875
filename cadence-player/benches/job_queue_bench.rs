//! Job Queue Performance Benchmark
//!
//! Measures scheduling and dispatch cost on the affinity thread and the
//! round trip through a dedicated job thread.
//!
//! **Goal:** Dispatch overhead well below the 5ms decoder update period

use cadence_player::job::{Closure, JobOwner, JobQueue, JobThread};
use cadence_player::pool::{FrameGeometry, FramePool};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bench_schedule_and_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue");
    let queue = JobQueue::new();
    let counter = Arc::new(AtomicU64::new(0));
    let job = {
        let counter = Arc::clone(&counter);
        Closure::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };

    for jobs in [1usize, 64, 1024] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::new("schedule_run_until_idle", jobs), &jobs, |b, &jobs| {
            b.iter(|| {
                for _ in 0..jobs {
                    queue.schedule(job.clone(), Duration::ZERO);
                }
                queue.run_until_idle();
            });
        });
    }

    group.bench_function("owner_cancel_1024", |b| {
        let owner = JobOwner::new(&queue);
        b.iter(|| {
            for _ in 0..1024 {
                owner.schedule(job.clone(), Duration::from_secs(60));
            }
            owner.cancel_pending_jobs();
        });
    });

    group.finish();
    black_box(counter.load(Ordering::Relaxed));
}

fn bench_cross_thread(c: &mut Criterion) {
    let job_thread = JobThread::spawn("bench").expect("job thread");

    c.bench_function("job_thread_run_sync", |b| {
        b.iter(|| {
            let value = job_thread.run_sync(|| black_box(42u32)).expect("job ran");
            black_box(value);
        });
    });
}

fn bench_frame_pool(c: &mut Criterion) {
    let pool = FramePool::new(26);
    let geometry = FrameGeometry::new(1920, 1080, 1920, 1088);

    c.bench_function("frame_pool_alloc_release_1080p", |b| {
        b.iter(|| {
            let lease = pool.alloc(black_box(geometry)).expect("free slot");
            black_box(lease.handle());
        });
    });
}

criterion_group!(benches, bench_schedule_and_run, bench_cross_thread, bench_frame_pool);
criterion_main!(benches);
