//! Integration tests for pipeline trees, drivers and the event bus.

#[cfg(test)]
mod tests {
    use crate::context::StageContext;
    use crate::core::{StageEvent, StageRef, StageStatus};
    use crate::driver::{DriverConfig, StageQueueFactory, ThreadDriverFactory};
    use crate::errors::{FaultPhase, QueueError, StagepipeError};
    use crate::events::{CollectingListener, StageEventListener};
    use crate::feeder::CollectingFeeder;
    use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig};
    use crate::stages::{FnStage, PassThroughStage, Stage};
    use crate::testing::{
        assert_event_count, assert_raised_before, assert_stage_events, wait_until, CountingStage,
        FlakyStage, SlowStage,
    };
    use mockall::mock;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    mock! {
        pub Listener {}

        impl StageEventListener for Listener {
            fn notify(&self, event: &StageEvent);
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_driver() -> DriverConfig {
        DriverConfig::new().with_poll_timeout(Duration::from_millis(20))
    }

    fn config(name: &str) -> PipelineConfig {
        PipelineConfig::new(name).with_driver(fast_driver())
    }

    fn tolerant_driver() -> ThreadDriverFactory<u32> {
        ThreadDriverFactory::from_config(&fast_driver()).fault_tolerant(true)
    }

    fn builder(name: &str) -> PipelineBuilder<u32> {
        PipelineBuilder::from_config(config(name))
    }

    fn pipeline(name: &str) -> Pipeline<u32> {
        Pipeline::with_config(config(name))
    }

    #[test]
    fn test_every_item_enqueued_before_finish_is_processed_once() {
        let first = Arc::new(CountingStage::<u32>::forwarding("first"));
        let second = Arc::new(CountingStage::<u32>::forwarding("second"));
        let third = Arc::new(CountingStage::<u32>::forwarding("third"));
        let sink = Arc::new(CollectingFeeder::<u32>::new());

        let pipeline = builder("drain")
            .shared_stage(first.clone())
            .shared_stage(second.clone())
            .shared_stage(third.clone())
            .terminal(sink.clone())
            .build()
            .unwrap();

        pipeline.start().unwrap();
        for n in 0..1_000 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();

        assert_eq!(first.count(), 1_000);
        assert_eq!(second.count(), 1_000);
        assert_eq!(third.count(), 1_000);

        let mut delivered = sink.take();
        delivered.sort_unstable();
        assert_eq!(delivered, (0..1_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_fifo_order_is_kept_along_a_chain() {
        let sink = Arc::new(CollectingFeeder::<u32>::new());
        let pipeline = builder("ordered")
            .stage(PassThroughStage::new("a"))
            .stage(PassThroughStage::new("b"))
            .terminal(sink.clone())
            .build()
            .unwrap();

        pipeline.start().unwrap();
        for n in 0..200 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();
        assert_eq!(sink.items(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_start_twice_fails_without_second_worker() {
        let stage = Arc::new(CountingStage::<u32>::new("single"));
        let pipeline = pipeline("twice");
        let stage_ref = pipeline
            .add_stage(stage.clone(), &ThreadDriverFactory::<u32>::from_config(&fast_driver()))
            .unwrap();
        let driver = pipeline.driver(stage_ref.id).unwrap();

        driver.start().unwrap();
        let err = driver.start().unwrap_err();
        assert!(matches!(
            err,
            StagepipeError::IllegalThreadState {
                status: StageStatus::Running,
                ..
            }
        ));

        for n in 0..50 {
            pipeline.enqueue(n).unwrap();
        }
        driver.finish().unwrap();

        assert_eq!(stage.count(), 50);
        assert_eq!(stage.worker_threads(), 1);
        assert_eq!(stage.preprocess_calls(), 1);
    }

    #[test]
    fn test_tolerant_stage_skips_every_second_item() {
        let flaky = Arc::new(FlakyStage::<u32>::new("flaky", 2).forwarding());
        let sink = Arc::new(CollectingFeeder::<u32>::new());
        let pipeline = builder("tolerant")
            .driver_factory(tolerant_driver())
            .shared_stage(flaky.clone())
            .terminal(sink.clone())
            .build()
            .unwrap();
        let stage = pipeline.stage_refs()[0].clone();

        pipeline.start().unwrap();
        for n in 1..=11 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();

        assert_eq!(flaky.succeeded(), 6);
        assert_eq!(sink.items(), vec![1, 3, 5, 7, 9, 11]);

        let failures = pipeline.driver(stage.id).unwrap().processing_failures();
        assert_eq!(failures.len(), 5);
        assert_eq!(
            failures.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![1, 3, 5, 7, 9]
        );
        assert_event_count(&pipeline.raised_events(), "stage.item_failed", 5);
        assert_eq!(pipeline.stage_status(stage.id), Some(StageStatus::Stopped));
    }

    #[test]
    fn test_intolerant_stage_stops_at_first_fault() {
        let flaky = Arc::new(FlakyStage::<u32>::new("flaky", 2));
        let pipeline = builder("intolerant")
            .shared_stage(flaky.clone())
            .build()
            .unwrap();
        let stage = pipeline.stage_refs()[0].clone();

        for n in 0..10 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.start().unwrap();
        assert!(wait_until(WAIT, || pipeline.stage_status(stage.id) == Some(StageStatus::Failed)));

        let err = pipeline.finish().unwrap_err();
        let fault = err.driver_fault().unwrap();
        assert_eq!(fault.stage, stage);
        assert_eq!(fault.phase, FaultPhase::Process);

        assert_eq!(flaky.seen(), 2);
        assert_eq!(flaky.succeeded(), 1);
        assert_eq!(flaky.postprocess_calls(), 0);
        assert_eq!(flaky.release_calls(), 1);

        let events = pipeline.raised_events();
        assert_stage_events(
            &events,
            &stage,
            &["stage.started", "stage.item_failed", "stage.failed"],
        );
        assert!(matches!(
            pipeline.enqueue(99),
            Err(StagepipeError::Queue(QueueError::Closed))
        ));

        // The fault is reported again by every later finish.
        assert!(pipeline.finish().unwrap_err().driver_fault().is_some());
    }

    #[test]
    fn test_failed_stage_does_not_stop_siblings() {
        let upstream = Arc::new(CountingStage::<u32>::forwarding("upstream"));
        let broken = Arc::new(FlakyStage::<u32>::new("broken", 1));
        let pipeline = builder("starved")
            .shared_stage_with(
                upstream.clone(),
                tolerant_driver(),
            )
            .shared_stage(broken.clone())
            .build()
            .unwrap();
        let refs = pipeline.stage_refs();

        pipeline.start().unwrap();
        pipeline.enqueue(1).unwrap();
        let broken_id = refs[1].id;
        assert!(wait_until(WAIT, || {
            pipeline.stage_status(broken_id) == Some(StageStatus::Failed)
        }));

        for n in 2..6 {
            pipeline.enqueue(n).unwrap();
        }
        let err = pipeline.finish().unwrap_err();
        assert_eq!(err.driver_fault().map(|f| f.stage.name.as_str()), Some("broken"));
        assert_eq!(broken.seen(), 1);

        assert_eq!(upstream.count(), 5);
        let upstream_failures = pipeline.driver(refs[0].id).unwrap().processing_failures();
        assert_eq!(upstream_failures.len(), 4);
        assert_eq!(pipeline.stage_status(refs[0].id), Some(StageStatus::Stopped));
    }

    #[test]
    fn test_downstream_feeders_follow_stage_order() {
        let pipeline = pipeline("feeders");
        let factory = ThreadDriverFactory::<u32>::from_config(&fast_driver());
        let a = pipeline.add_stage(Arc::new(CountingStage::<u32>::new("a")), &factory).unwrap();
        let b = pipeline.add_stage(Arc::new(CountingStage::<u32>::new("b")), &factory).unwrap();
        let c = pipeline.add_stage(Arc::new(CountingStage::<u32>::new("c")), &factory).unwrap();
        let sink = Arc::new(CollectingFeeder::<u32>::new());
        pipeline.set_terminal_feeder(sink.clone());

        pipeline.downstream_feeder(a.id).unwrap().feed(1).unwrap();
        let pending = |id| pipeline.driver(id).unwrap().pending();
        assert_eq!((pending(a.id), pending(b.id), pending(c.id)), (0, 1, 0));

        pipeline.downstream_feeder(c.id).unwrap().feed(2).unwrap();
        assert_eq!((pending(a.id), pending(b.id), pending(c.id)), (0, 1, 0));
        assert_eq!(sink.items(), vec![2]);
    }

    #[test]
    fn test_listener_on_any_node_sees_events_from_other_nodes() {
        let root = pipeline("root");
        let b1 = pipeline("b1");
        let b2 = pipeline("b2");
        let stage = b1.add_default_stage(Arc::new(CountingStage::<u32>::new("inside-b1"))).unwrap();
        b2.add_default_stage(Arc::new(CountingStage::<u32>::new("inside-b2"))).unwrap();
        root.add_branch("b1", b1.clone()).unwrap();
        root.add_branch("b2", b2.clone()).unwrap();

        let expected: StageRef = stage.clone();
        let mut listener = MockListener::new();
        listener
            .expect_notify()
            .withf(move |event| {
                event.event_type == "custom" && event.source.as_ref() == Some(&expected)
            })
            .times(1)
            .return_const(());
        b2.register_listener(Arc::new(listener));

        b1.raise(StageEvent::from_stage("custom", stage));
        assert_eq!(root.raised_events().len(), 1);
    }

    #[test]
    fn test_branches_share_events_but_not_items() {
        let in_b1 = Arc::new(CountingStage::<u32>::new("in-b1"));
        let in_b2 = Arc::new(CountingStage::<u32>::new("in-b2"));
        let b1 = builder("b1")
            .shared_stage(in_b1.clone())
            .build()
            .unwrap();
        let b2 = builder("b2")
            .shared_stage(in_b2.clone())
            .build()
            .unwrap();
        let root = builder("root")
            .branch("b1", b1.clone())
            .branch("b2", b2.clone())
            .build()
            .unwrap();

        let listener = Arc::new(CollectingListener::new());
        b2.register_listener(listener.clone());

        root.start().unwrap();
        assert!(b1.is_running() && b2.is_running());
        for n in 0..20 {
            b1.enqueue(n).unwrap();
        }
        root.finish().unwrap();

        assert_eq!(in_b1.count(), 20);
        assert_eq!(in_b2.count(), 0);

        let b1_stage = b1.stage_refs()[0].clone();
        assert_stage_events(&listener.events(), &b1_stage, &["stage.started", "stage.stopped"]);
        assert_raised_before(&root.raised_events(), "pipeline.started", "pipeline.finished");
    }

    #[test]
    fn test_stage_routes_items_into_branches() {
        let evens = Arc::new(CountingStage::<u32>::new("evens"));
        let odds = Arc::new(CountingStage::<u32>::new("odds"));
        let router = FnStage::new("router", |n: u32, ctx: &StageContext<u32>| {
            let key = if n % 2 == 0 { "even" } else { "odd" };
            ctx.branch_feeder(key)?.feed(n)?;
            Ok(())
        });

        let root = builder("router")
            .stage(router)
            .branch(
                "even",
                builder("even").shared_stage(evens.clone()).build().unwrap(),
            )
            .branch(
                "odd",
                builder("odd").shared_stage(odds.clone()).build().unwrap(),
            )
            .build()
            .unwrap();

        root.start().unwrap();
        for n in 0..31 {
            root.enqueue(n).unwrap();
        }
        root.finish().unwrap();

        assert_eq!(evens.count(), 16);
        assert_eq!(odds.count(), 15);
    }

    #[test]
    fn test_branch_created_on_first_use_is_started() {
        let created = Arc::new(Mutex::new(Vec::<Arc<CountingStage<u32>>>::new()));
        let registry = created.clone();
        let root = builder("lazy")
            .stage(FnStage::new("fanout", |n: u32, ctx: &StageContext<u32>| {
                ctx.branch_feeder(&format!("shard-{}", n % 3))?.feed(n)?;
                Ok(())
            }))
            .branch_factory(move |key: &str| {
                let stage = Arc::new(CountingStage::<u32>::new(key));
                registry.lock().push(stage.clone());
                builder(key).shared_stage(stage).build()
            })
            .build()
            .unwrap();

        root.start().unwrap();
        for n in 0..30 {
            root.enqueue(n).unwrap();
        }
        root.finish().unwrap();

        assert_eq!(root.branch_keys(), vec!["shard-0", "shard-1", "shard-2"]);
        let stages = created.lock();
        assert_eq!(stages.len(), 3);
        assert!(stages.iter().all(|stage| stage.count() == 10));
        assert!(root.branch_keys().iter().all(|key| !root.branch(key).unwrap().is_running()));
    }

    #[test]
    fn test_branch_attached_while_running_is_started() {
        let root = pipeline("root");
        root.start().unwrap();

        let late = Arc::new(CountingStage::<u32>::new("late"));
        let branch = pipeline("late");
        branch.add_default_stage(late.clone()).unwrap();
        root.add_branch("late", branch.clone()).unwrap();
        assert!(branch.is_running());

        branch.enqueue(1).unwrap();
        root.finish().unwrap();
        assert_eq!(late.count(), 1);
        assert!(!branch.is_running());
    }

    #[test]
    fn test_idle_finish_returns_within_poll_window() {
        let poll = Duration::from_millis(300);
        let pipeline = Pipeline::with_config(
            PipelineConfig::new("idle").with_driver(DriverConfig::new().with_poll_timeout(poll)),
        );
        pipeline
            .add_default_stage(Arc::new(CountingStage::<u32>::new("idle")))
            .unwrap();
        pipeline.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        pipeline.finish().unwrap();
        assert!(started.elapsed() < poll + Duration::from_millis(250));
    }

    #[test]
    fn test_finish_drains_slow_stage_completely() {
        let slow = Arc::new(SlowStage::<u32>::with_delay_ms("slow", 1));
        let pipeline = builder("slow")
            .shared_stage(slow.clone())
            .build()
            .unwrap();
        pipeline.start().unwrap();
        for n in 0..100 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();
        assert_eq!(slow.count(), 100);
    }

    #[test]
    fn test_stage_queue_and_thread_driver_interoperate() {
        let head = Arc::new(CountingStage::<u32>::forwarding("head"));
        let tail = Arc::new(CountingStage::<u32>::forwarding("tail"));
        let sink = Arc::new(CollectingFeeder::<u32>::new());
        let pipeline = builder("mixed")
            .shared_stage_with(head.clone(), StageQueueFactory::new())
            .shared_stage(tail.clone())
            .terminal(sink.clone())
            .build()
            .unwrap();

        pipeline.start().unwrap();
        for n in 0..500 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();

        assert_eq!(head.count(), 500);
        assert_eq!(tail.count(), 500);
        assert_eq!(sink.len(), 500);
    }

    #[test]
    fn test_finish_from_own_worker_is_illegal() {
        let outcome = Arc::new(Mutex::new(None));
        let seen = outcome.clone();
        let pipeline = builder("self-stop")
            .stage(FnStage::new("self", move |_n: u32, ctx: &StageContext<u32>| {
                let pipeline = ctx.pipeline()?;
                let driver = pipeline
                    .driver(ctx.stage().id)
                    .ok_or_else(|| anyhow::anyhow!("driver missing"))?;
                *seen.lock() = Some(driver.finish());
                Ok(())
            }))
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.enqueue(1).unwrap();
        pipeline.finish().unwrap();

        let result = outcome.lock().take().unwrap();
        assert!(matches!(result, Err(StagepipeError::IllegalState(_))));
    }

    #[test]
    fn test_stage_reads_inherited_environment() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let branch = builder("child")
            .stage(FnStage::new("reader", move |_n: u32, ctx: &StageContext<u32>| {
                record.lock().push(ctx.env("region"));
                Ok(())
            }))
            .build()
            .unwrap();
        let root = builder("root")
            .env("region", serde_json::json!("eu-west"))
            .branch("child", branch.clone())
            .build()
            .unwrap();

        root.start().unwrap();
        branch.enqueue(1).unwrap();
        root.finish().unwrap();

        assert_eq!(*seen.lock(), vec![Some(serde_json::json!("eu-west"))]);
    }

    #[test]
    fn test_lifecycle_hooks_run_once_per_cycle() {
        let stage = Arc::new(CountingStage::<u32>::new("hooks"));
        let pipeline = builder("hooks")
            .shared_stage(stage.clone())
            .build()
            .unwrap();

        pipeline.start().unwrap();
        pipeline.enqueue(1).unwrap();
        pipeline.finish().unwrap();

        assert_eq!(stage.preprocess_calls(), 1);
        assert_eq!(stage.postprocess_calls(), 1);
        assert_eq!(stage.release_calls(), 1);
    }

    #[test]
    fn test_init_failure_is_a_construction_error() {
        #[derive(Debug)]
        struct Unready;

        impl Stage<u32> for Unready {
            fn name(&self) -> &str {
                "unready"
            }

            fn init(&self, _ctx: &StageContext<u32>) -> crate::stages::StageResult {
                anyhow::bail!("missing resource")
            }

            fn process(&self, _item: u32) -> crate::stages::StageResult {
                Ok(())
            }
        }

        let err = builder("init")
            .stage(Unready)
            .build()
            .unwrap_err();
        assert!(err.is_construction());
        assert!(err.to_string().contains("unready"));
    }

    #[test]
    fn test_stage_bound_in_one_pipeline_is_refused_by_another() {
        let stage = Arc::new(PassThroughStage::<u32>::new("pass"));
        let sink = Arc::new(CollectingFeeder::<u32>::new());
        let first = builder("first")
            .shared_stage(stage.clone())
            .terminal(sink.clone())
            .build()
            .unwrap();

        let err = builder("second").shared_stage(stage).build().unwrap_err();
        assert!(err.is_construction());
        assert!(err.to_string().contains("already bound"));

        first.start().unwrap();
        first.enqueue(3).unwrap();
        first.finish().unwrap();
        assert_eq!(sink.items(), vec![3]);
    }

    #[test]
    fn test_panicking_stage_is_a_per_item_fault() {
        let pipeline = builder("panics")
            .driver_factory(tolerant_driver())
            .stage(FnStage::new("explosive", |n: u32, _ctx: &StageContext<u32>| {
                assert!(n != 3, "cannot handle three");
                Ok(())
            }))
            .build()
            .unwrap();
        let stage = pipeline.stage_refs()[0].clone();

        pipeline.start().unwrap();
        for n in 0..5 {
            pipeline.enqueue(n).unwrap();
        }
        pipeline.finish().unwrap();

        let failures = pipeline.driver(stage.id).unwrap().processing_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("cannot handle three"));
    }

    #[test]
    fn test_event_log_limit_keeps_latest_events() {
        let pipeline = Pipeline::<u32>::with_config(config("bounded-log").with_event_log_limit(2));
        for name in ["a", "b", "c"] {
            pipeline.raise(StageEvent::new(name));
        }
        let types: Vec<_> = pipeline
            .raised_events()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["b", "c"]);
    }

    #[test]
    fn test_attached_branch_brings_its_listeners() {
        let root = pipeline("root");
        let child = pipeline("child");
        let listener = Arc::new(CollectingListener::new());
        child.register_listener(listener.clone());
        child.raise(StageEvent::new("before-attach"));

        root.add_branch("child", child).unwrap();
        root.raise(StageEvent::new("after-attach"));

        assert_eq!(listener.len(), 2);
        assert_eq!(root.raised_events().len(), 2);
    }
}
