//! Benchmarks for the cooperative scheduler and the worker pool.
//!
//! Benchmarks cover:
//! - Context switches between suspended tasks
//! - Gathers over many sleeping tasks on the virtual clock
//! - Generator iteration
//! - Worker pool submit/wait throughput and ordered collection

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use coop_runtime::config::WorkerPoolConfig;
use coop_runtime::core::{aggregate, Generator, Scheduler, TaskHandle, WorkerPool};

// ============================================================================
// Scheduler Benchmarks
// ============================================================================

fn bench_scheduler_yield_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_yield_ping_pong");

    for yields in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(yields * 2));
        group.bench_with_input(BenchmarkId::from_parameter(yields), &yields, |b, &yields| {
            b.iter(|| {
                let mut sched = Scheduler::<u64>::new();
                for _ in 0..2 {
                    sched.submit(move |ctx| {
                        for _ in 0..yields {
                            ctx.yield_now()?;
                        }
                        Ok(yields)
                    });
                }
                black_box(sched.run().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_scheduler_gather_sleeps(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_gather_sleeps");

    for tasks in [10_u64, 100, 1_000] {
        group.throughput(Throughput::Elements(tasks));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let mut sched = Scheduler::<u64>::new();
                let handles: Vec<TaskHandle> = (0..tasks)
                    .map(|i| {
                        sched.submit(move |ctx| {
                            ctx.sleep(Duration::from_millis(i % 17))?;
                            Ok(i)
                        })
                    })
                    .collect();
                let all = sched.gather(&handles).unwrap();
                sched.run_until_complete([all]).unwrap();
                black_box(sched.gather_result(all).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_generator_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("generator_iteration");
    let items = 10_000_u64;
    group.throughput(Throughput::Elements(items));
    group.bench_function("squares", |b| {
        b.iter(|| {
            let squares = Generator::new(move |s| {
                for n in 0..items {
                    s.suspend(n * n)?;
                }
                Ok(())
            });
            black_box(squares.map(Result::unwrap).sum::<u64>());
        });
    });
    group.finish();
}

// ============================================================================
// Worker Pool Benchmarks
// ============================================================================

fn bench_pool_submit_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_submit_wait");

    for workers in [1_usize, 4, 8] {
        let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(workers)).unwrap();
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let handles: Vec<_> = (0..1_000_u64)
                    .map(|i| pool.submit(move || Ok(i.wrapping_mul(31))).unwrap())
                    .collect();
                black_box(aggregate::collect_ordered(handles).unwrap());
            });
        });
        pool.shutdown(true);
    }
    group.finish();
}

fn bench_pool_map_vs_as_completed(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_collection_order");
    let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(4)).unwrap();

    group.bench_function("map_ordered", |b| {
        b.iter(|| {
            let values: Vec<u64> = pool
                .map(|i: u64| Ok(i * 2), 0..256)
                .unwrap()
                .map(Result::unwrap)
                .collect();
            black_box(values);
        });
    });

    group.bench_function("as_completed", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..256_u64)
                .map(|i| pool.submit(move || Ok(i * 2)).unwrap())
                .collect();
            let total: u64 = aggregate::collect_as_completed(handles)
                .map(Result::unwrap)
                .sum();
            black_box(total);
        });
    });

    group.finish();
    pool.shutdown(true);
}

criterion_group!(
    scheduler_benches,
    bench_scheduler_yield_ping_pong,
    bench_scheduler_gather_sleeps,
    bench_generator_iteration
);

criterion_group!(pool_benches, bench_pool_submit_wait, bench_pool_map_vs_as_completed);

criterion_main!(scheduler_benches, pool_benches);
