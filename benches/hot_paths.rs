use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use cltiming::clock::{normalize, ManualClock};
use cltiming::driver::scripted::ScriptedDriver;
use cltiming::driver::{
    CommandStatus, DeviceCounters, DeviceId, DualTimerReading, OperationHandle, QueueId,
};
use cltiming::{Config, Pipeline};

const GPU: DeviceId = DeviceId(1);
const BATCH: u64 = 256;

fn scripted_driver() -> Arc<ScriptedDriver> {
    let driver = Arc::new(ScriptedDriver::new());
    driver.add_device(
        GPU,
        "bench gpu",
        Some(DualTimerReading {
            device_ns: 1_000,
            host_ns: 1_000,
        }),
    );
    for raw in 1..=BATCH {
        let h = OperationHandle(raw);
        driver.script_status(h, &[CommandStatus::Complete]);
        driver.set_counters(
            h,
            DeviceCounters {
                queued: 1_000,
                submitted: 1_100,
                started: 1_200,
                ended: 1_200 + raw,
            },
        );
    }
    driver
}

fn quiet_pipeline(driver: Arc<ScriptedDriver>) -> Pipeline {
    let mut cfg = Config::default();
    cfg.report.to_stderr = false;
    Pipeline::new(&cfg, driver, Arc::new(ManualClock::new(1_000))).expect("pipeline")
}

fn bench_record_and_drain(c: &mut Criterion) {
    let driver = scripted_driver();

    c.bench_function("pipeline/record_drain_256", |b| {
        b.iter_batched(
            || quiet_pipeline(Arc::clone(&driver)),
            |pipeline| {
                for raw in 1..=BATCH {
                    pipeline.record_pending(GPU, OperationHandle(raw), "kernel", QueueId(1), raw);
                }
                black_box(pipeline.drain())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_host_update(c: &mut Criterion) {
    let pipeline = quiet_pipeline(scripted_driver());
    pipeline.update_host_timing("clEnqueueNDRangeKernel", 1);

    c.bench_function("pipeline/update_host_timing_existing_tag", |b| {
        b.iter(|| pipeline.update_host_timing(black_box("clEnqueueNDRangeKernel"), black_box(42)))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let raw = DeviceCounters {
        queued: 5_100,
        submitted: 5_200,
        started: 5_300,
        ended: 5_900,
    };

    c.bench_function("normalize/profiling_anchor", |b| {
        b.iter(|| normalize(black_box(&raw), black_box(1_000), Some(-4_000), 1_000_000_000))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_record_and_drain(c);
    bench_host_update(c);
    bench_normalize(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
