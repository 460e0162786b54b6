//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stagepipe::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn three_stage_pipeline(factory: impl StageDriverFactory<u64> + 'static) -> Pipeline<u64> {
    PipelineBuilder::new("bench")
        .driver_factory(factory)
        .stage(FnStage::new("inc", |n: u64, ctx: &StageContext<u64>| {
            ctx.feed_downstream(n + 1)?;
            Ok(())
        }))
        .stage(PassThroughStage::new("forward"))
        .stage(NoOpStage::new("sink"))
        .build()
        .unwrap_or_else(|err| panic!("bench pipeline: {err}"))
}

fn run_items(pipeline: &Pipeline<u64>, items: u64) {
    pipeline.start().unwrap_or_else(|err| panic!("start: {err}"));
    for n in 0..items {
        pipeline
            .enqueue(black_box(n))
            .unwrap_or_else(|err| panic!("enqueue: {err}"));
    }
    pipeline.finish().unwrap_or_else(|err| panic!("finish: {err}"));
}

fn pipeline_benchmark(c: &mut Criterion) {
    let config = DriverConfig::new().with_poll_timeout(Duration::from_millis(10));
    let mut group = c.benchmark_group("three_stages");

    for items in [1_000_u64, 10_000] {
        group.throughput(Throughput::Elements(items));
        group.bench_with_input(BenchmarkId::new("thread_driver", items), &items, |b, &items| {
            b.iter(|| {
                let pipeline = three_stage_pipeline(ThreadDriverFactory::from_config(&config));
                run_items(&pipeline, items);
            });
        });
        group.bench_with_input(BenchmarkId::new("stage_queue", items), &items, |b, &items| {
            b.iter(|| {
                let pipeline = three_stage_pipeline(StageQueueFactory::from_config(&config));
                run_items(&pipeline, items);
            });
        });
    }
    group.finish();
}

fn event_bus_benchmark(c: &mut Criterion) {
    let bus = EventBus::with_log_limit(Some(1_024));
    bus.register(Arc::new(FnListener::new(|event: &StageEvent| {
        black_box(event);
    })));
    let stage = StageRef::new(StageId::new(), "bench");

    c.bench_function("event_bus_raise", |b| {
        b.iter(|| bus.raise(black_box(&StageEvent::started(&stage))));
    });
}

criterion_group!(benches, pipeline_benchmark, event_bus_benchmark);
criterion_main!(benches);
