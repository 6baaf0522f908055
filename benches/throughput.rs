//! Throughput benchmark using criterion.
//!
//! Measures job throughput when a root job fans out 100,000 tiny jobs in
//! batches sized to fit the bounded Normal queue, waiting on a counter after
//! each batch.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fiberjobs::{Counter, JobPriority, JobSystem, JobSystemConfig, JobSystemHandle};

const JOB_COUNT: usize = 100_000;
const BATCH: usize = 1024;

fn fan_out(system: &JobSystemHandle) {
    let counter = Counter::new(0);
    for _ in 0..JOB_COUNT / BATCH {
        for _ in 0..BATCH {
            let job = system.create_job(JobPriority::Normal, || {
                std::hint::black_box(1 + 1);
            });
            job.set_counter(&counter).unwrap();
            system.schedule(JobPriority::Normal, &job).unwrap();
        }
        system.wait_for_counter(&counter, 0).unwrap();
    }
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements((JOB_COUNT / BATCH * BATCH) as u64));
    group.sample_size(10);

    for threads in [1, 2, 4, num_cpus::get()] {
        let system = JobSystem::start(JobSystemConfig::with_threads(threads)).unwrap();
        let handle = system.handle();

        group.bench_function(BenchmarkId::new("fan_out", threads), |b| {
            b.iter(|| {
                let root_handle = handle.clone();
                let root = handle.create_job(JobPriority::High, move || fan_out(&root_handle));
                handle.wait_for_single(JobPriority::High, &root).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_schedule_from_main_thread(c: &mut Criterion) {
    let system = JobSystem::start(JobSystemConfig::default()).unwrap();
    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function("schedule_batch_external", |b| {
        b.iter(|| {
            let counter = Counter::new(0);
            for _ in 0..BATCH {
                let job = system.create_job(JobPriority::Normal, || ());
                job.set_counter(&counter).unwrap();
                system.schedule(JobPriority::Normal, &job).unwrap();
            }
            system.wait_for_counter(&counter, 0).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_schedule_from_main_thread);
criterion_main!(benches);
