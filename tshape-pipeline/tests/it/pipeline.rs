use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;
use tshape_pipeline::{
    PipelineError, PipelineOptions, PipelineState, ShapingConfig, ShapingPipeline, Verdict,
};
use tshape_sched::{Algorithm, ClassConfig, ConfigError, DropReason, DscpClassifier, Packet, Rate};

/// Collects `(packet id, reason)` for every drop reported by the pipeline.
fn record_drops(pipeline: &ShapingPipeline) -> Arc<Mutex<Vec<(u64, DropReason)>>> {
    let drops = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drops);
    pipeline.set_drop_hook(move |packet, reason| sink.lock().push((packet.id(), reason)));
    drops
}

fn packet(id: u64, size: u32, class: u32) -> Packet {
    Packet::new(size).with_id(id).with_class(class)
}

/// Receives until the pipeline has been quiet for `idle`.
async fn drain(pipeline: &ShapingPipeline, idle: Duration) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Some(packet) = pipeline.recv_timeout(idle).await {
        packets.push(packet);
    }
    packets
}

#[tokio::test]
async fn enqueue_requires_running() {
    let _ = tracing_subscriber::fmt::try_init();

    let pipeline = ShapingPipeline::new("eth0");
    assert_eq!(pipeline.state(), PipelineState::Created);
    assert!(matches!(
        pipeline.enqueue_packet(packet(0, 100, 1)),
        Err(PipelineError::NotRunning(PipelineState::Created))
    ));
    assert!(matches!(pipeline.start(), Err(PipelineError::NotConfigured)));

    let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_bytes_per_sec(1_000))
        .with_class(ClassConfig::new(1));
    pipeline.configure(config.clone()).unwrap();
    assert!(matches!(
        pipeline.enqueue_packet(packet(0, 100, 1)),
        Err(PipelineError::NotRunning(PipelineState::Configured))
    ));

    pipeline.start().unwrap();
    assert!(matches!(pipeline.configure(config), Err(PipelineError::Running)));
    assert_eq!(pipeline.statistics().received.packets, 0);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn token_bucket_paces_emission() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::TokenBucket, Rate::from_bytes_per_sec(1_000))
        .with_burst(1_000)
        .with_class(ClassConfig::new(1));
    let pipeline = ShapingPipeline::configured("tbf", config, PipelineOptions::default()).unwrap();
    pipeline.start().unwrap();

    let start = Instant::now();
    for id in 0..5 {
        assert!(pipeline.enqueue_packet(packet(id, 500, 1)).unwrap().is_queued());
    }

    for expected in 0..5u64 {
        let shaped = pipeline.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(shaped.id(), expected);

        // The first two fit the burst, then one packet every 500ms.
        let due = Duration::from_millis(500 * expected.saturating_sub(1));
        let elapsed = start.elapsed();
        assert!(elapsed >= due, "packet {expected} left at {elapsed:?}, due {due:?}");
        assert!(elapsed <= due + Duration::from_millis(20), "packet {expected} late: {elapsed:?}");
    }

    let stats = pipeline.statistics();
    assert_eq!(stats.dequeued.bytes, 2_500);
    assert!(stats.is_drained());
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn drops_are_accounted_and_conserved() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_bytes_per_sec(1_000_000))
        .with_burst(10_000)
        .with_class(ClassConfig::new(1).with_max_queue_packets(5))
        .with_class(ClassConfig::new(2).with_weight(2));
    let pipeline = ShapingPipeline::configured("wfq", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    for id in 0..20 {
        let verdict = pipeline.enqueue_packet(packet(id, 100, 1)).unwrap();
        if id < 5 {
            assert_eq!(verdict, Verdict::Queued { class_id: 1 });
        } else {
            assert_eq!(verdict, Verdict::Dropped(DropReason::QueueFull));
        }
    }
    for id in 20..25 {
        assert!(pipeline.enqueue_packet(packet(id, 100, 2)).unwrap().is_queued());
    }

    let unknown = pipeline.enqueue_packet(packet(25, 100, 9)).unwrap();
    assert_eq!(unknown, Verdict::Dropped(DropReason::UnknownClass));
    let empty = pipeline.enqueue_packet(packet(26, 0, 2)).unwrap();
    assert_eq!(empty, Verdict::Dropped(DropReason::Malformed));
    let jumbo = pipeline.enqueue_packet(packet(27, 20_000, 2)).unwrap();
    assert_eq!(jumbo, Verdict::Dropped(DropReason::ExceedsBurst));

    let shaped = drain(&pipeline, Duration::from_millis(100)).await;
    assert_eq!(shaped.len(), 10);

    let stats = pipeline.statistics();
    assert!(stats.is_drained());
    assert_eq!(stats.received.packets, 28);
    assert_eq!(stats.enqueued.packets, 10);
    assert_eq!(stats.dequeued.packets, 10);
    assert_eq!(stats.dropped.packets, 18);
    assert_eq!(stats.drops(DropReason::QueueFull).packets, 15);
    assert_eq!(stats.drops(DropReason::UnknownClass).packets, 1);
    assert_eq!(stats.drops(DropReason::Malformed).packets, 1);
    assert_eq!(stats.drops(DropReason::ExceedsBurst).bytes, 20_000);

    let class_1 = stats.class(1).unwrap();
    assert_eq!(class_1.enqueued.packets, 5);
    assert_eq!(class_1.dropped.packets, 15);
    assert_eq!(class_1.dequeued.packets, 5);

    // One hook call per drop, and never for an admitted packet.
    let drops = drops.lock();
    assert_eq!(drops.len(), 18);
    assert!(drops.iter().all(|(id, _)| *id >= 5 && *id != 20));

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_backlog() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::TokenBucket, Rate::from_bytes_per_sec(100))
        .with_burst(200)
        .with_class(ClassConfig::new(1));
    let pipeline = ShapingPipeline::configured("slow", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    for id in 0..10 {
        pipeline.enqueue_packet(packet(id, 100, 1)).unwrap();
    }
    assert_eq!(pipeline.recv().await.map(|p| p.id()), Some(0));
    assert_eq!(pipeline.recv().await.map(|p| p.id()), Some(1));

    pipeline.stop().await;
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let stats = pipeline.statistics();
    assert_eq!(stats.dequeued.packets, 2);
    assert_eq!(stats.drops(DropReason::Shutdown).packets, 8);
    assert!(stats.is_drained());
    assert_eq!(drops.lock().iter().filter(|(_, r)| *r == DropReason::Shutdown).count(), 8);

    assert!(matches!(
        pipeline.enqueue_packet(packet(10, 100, 1)),
        Err(PipelineError::NotRunning(PipelineState::Stopped))
    ));

    // A stopped pipeline can be started again with its configuration.
    pipeline.start().unwrap();
    assert!(pipeline.enqueue_packet(packet(11, 100, 1)).unwrap().is_queued());
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn live_changes_keep_queued_packets() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::Drr, Rate::from_bytes_per_sec(100))
        .with_burst(100)
        .with_class(ClassConfig::new(1).with_quantum(100))
        .with_class(ClassConfig::new(2).with_quantum(100));
    let pipeline = ShapingPipeline::configured("drr", config, PipelineOptions::default()).unwrap();
    pipeline.start().unwrap();

    for id in 0..6 {
        pipeline.enqueue_packet(packet(id, 100, 1 + (id % 2) as u32)).unwrap();
    }
    assert!(pipeline.recv().await.is_some());

    pipeline.update_class(ClassConfig::new(1).with_quantum(300)).unwrap();
    pipeline.add_class(ClassConfig::new(3)).unwrap();
    pipeline.set_rate(Rate::from_bytes_per_sec(1_000_000)).unwrap();
    pipeline.set_burst(10_000).unwrap();

    let rest = drain(&pipeline, Duration::from_millis(100)).await;
    let mut ids: Vec<_> = rest.iter().map(Packet::id).collect();
    assert_eq!(ids.len(), 5);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);

    let config = pipeline.config().unwrap();
    assert_eq!(config.rate, Rate::from_bytes_per_sec(1_000_000));
    assert_eq!(config.classes.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(config.classes[0].quantum, 300);

    assert!(pipeline.statistics().is_drained());
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconfigure_migrates_backlog() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_bytes_per_sec(100))
        .with_burst(100)
        .with_class(ClassConfig::new(1))
        .with_class(ClassConfig::new(2));
    let pipeline = ShapingPipeline::configured("wfq", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    for id in 0..6 {
        pipeline.enqueue_packet(packet(id, 100, 1 + (id / 3) as u32)).unwrap();
    }
    // Equal weights and a finish time tie: class 1 goes first.
    assert_eq!(pipeline.recv().await.map(|p| p.id()), Some(0));

    let next = ShapingConfig::new(Algorithm::Drr, Rate::from_bytes_per_sec(1_000_000))
        .with_class(ClassConfig::new(1));
    pipeline.reconfigure(next).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    let rest: Vec<_> = drain(&pipeline, Duration::from_millis(100)).await;
    assert_eq!(rest.iter().map(Packet::id).collect::<Vec<_>>(), vec![1, 2]);

    let stats = pipeline.statistics();
    assert_eq!(stats.algorithm, Some(Algorithm::Drr));
    assert_eq!(stats.drops(DropReason::Reconfigured).packets, 3);
    assert!(stats.is_drained());
    assert_eq!(drops.lock().iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![3, 4, 5]);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn class_removal_and_default_class() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::TokenBucket, Rate::from_bytes_per_sec(100))
        .with_burst(100)
        .with_class(ClassConfig::new(1))
        .with_class(ClassConfig::new(2))
        .with_default_class(1);
    let pipeline = ShapingPipeline::configured("tbf", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    pipeline.enqueue_packet(packet(0, 100, 1)).unwrap();
    for id in 1..4 {
        pipeline.enqueue_packet(packet(id, 100, 2)).unwrap();
    }

    pipeline.remove_class(2).unwrap();
    assert_eq!(
        drops.lock().clone(),
        vec![
            (1, DropReason::ClassRemoved),
            (2, DropReason::ClassRemoved),
            (3, DropReason::ClassRemoved)
        ]
    );

    assert!(matches!(
        pipeline.remove_class(1),
        Err(PipelineError::Config(ConfigError::DefaultClassRemoval(1)))
    ));
    assert!(matches!(
        pipeline.remove_class(2),
        Err(PipelineError::Config(ConfigError::UnknownClass(2)))
    ));

    // Class 2 is gone: its packets now land in the default class.
    let verdict = pipeline.enqueue_packet(packet(4, 100, 2)).unwrap();
    assert_eq!(verdict, Verdict::Queued { class_id: 1 });

    let stats = pipeline.statistics();
    assert_eq!(stats.drops(DropReason::ClassRemoved).packets, 3);
    assert!(stats.class(2).is_none());
    assert_eq!(stats.received.packets, stats.dropped.packets + stats.backlog.packets);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn classifier_picks_class() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_bytes_per_sec(1_000_000))
        .with_class(ClassConfig::new(1).with_weight(4))
        .with_class(ClassConfig::new(2))
        .with_classifier(DscpClassifier::new(2).with_mapping(46, 1));
    let pipeline = ShapingPipeline::configured("dscp", config, PipelineOptions::default()).unwrap();
    pipeline.start().unwrap();

    let voice = pipeline.enqueue_packet(Packet::new(200).with_dscp(46)).unwrap();
    assert_eq!(voice, Verdict::Queued { class_id: 1 });
    let bulk = pipeline.enqueue_packet(Packet::new(200)).unwrap();
    assert_eq!(bulk, Verdict::Queued { class_id: 2 });

    // An explicit class wins over the classifier, and an unknown one is dropped.
    let pinned = pipeline.enqueue_packet(Packet::new(200).with_dscp(46).with_class(2)).unwrap();
    assert_eq!(pinned, Verdict::Queued { class_id: 2 });
    let unknown = pipeline.enqueue_packet(Packet::new(200).with_class(7)).unwrap();
    assert_eq!(unknown, Verdict::Dropped(DropReason::UnknownClass));

    let shaped = drain(&pipeline, Duration::from_millis(50)).await;
    assert_eq!(shaped.iter().map(|p| p.class_id()).collect::<Vec<_>>(), vec![
        Some(1),
        Some(2),
        Some(2)
    ]);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn emit_hook_replaces_channel() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::Drr, Rate::from_bytes_per_sec(1_000_000))
        .with_class(ClassConfig::new(1));
    let pipeline = ShapingPipeline::configured("hook", config, PipelineOptions::default()).unwrap();

    let emitted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&emitted);
    pipeline.set_emit_hook(move |packet| sink.lock().push(packet.id()));
    pipeline.start().unwrap();

    for id in 0..5 {
        pipeline.enqueue_packet(packet(id, 100, 1)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(*emitted.lock(), vec![0, 1, 2, 3, 4]);
    assert!(pipeline.try_recv().is_none());
    assert_eq!(pipeline.statistics().dequeued.packets, 5);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lowered_burst_drops_oversized_head() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::TokenBucket, Rate::from_bytes_per_sec(100))
        .with_burst(3_000)
        .with_class(ClassConfig::new(1));
    let pipeline = ShapingPipeline::configured("tbf", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    for id in 0..3 {
        pipeline.enqueue_packet(packet(id, 1_500, 1)).unwrap();
    }
    assert!(pipeline.recv().await.is_some());
    assert!(pipeline.recv().await.is_some());

    pipeline.set_burst(1_000).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(drops.lock().clone(), vec![(2, DropReason::ExceedsBurst)]);
    assert!(pipeline.statistics().is_drained());

    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_producers_keep_class_order() {
    let _ = tracing_subscriber::fmt::try_init();

    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u64 = 500;

    let config = ShapingConfig::new(Algorithm::Drr, Rate::from_bytes_per_sec(100_000_000))
        .with_burst(1_000_000)
        .with_classes(
            (1..=PRODUCERS).map(|id| ClassConfig::new(id).with_max_queue_packets(10_000)),
        );
    let pipeline = ShapingPipeline::configured("mt", config, PipelineOptions::default()).unwrap();
    pipeline.start().unwrap();

    let producers: Vec<_> = (1..=PRODUCERS)
        .map(|class| {
            let pipeline = pipeline.clone();
            tokio::task::spawn_blocking(move || {
                for seq in 0..PER_PRODUCER {
                    let verdict = pipeline.enqueue_packet(packet(seq, 200, class)).unwrap();
                    assert!(verdict.is_queued());
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let mut last_seen = HashMap::new();
    let mut received = 0;
    while received < PRODUCERS as u64 * PER_PRODUCER {
        let packet = pipeline.recv_timeout(Duration::from_secs(5)).await.expect("pipeline stalled");
        let class = packet.class_id().unwrap();
        if let Some(previous) = last_seen.insert(class, packet.id()) {
            assert!(packet.id() > previous, "class {class} reordered");
        }
        received += 1;
    }

    let stats = pipeline.statistics();
    assert_eq!(stats.dequeued.packets, received);
    assert_eq!(stats.dropped.packets, 0);
    assert!(stats.is_drained());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn htb_ceil_paces_class() {
    let _ = tracing_subscriber::fmt::try_init();

    // The aggregate rate never binds: only the class ceil holds packets back.
    let ceil = Rate::from_bytes_per_sec(1_000);
    let config = ShapingConfig::new(Algorithm::Htb, Rate::from_bytes_per_sec(1_000_000))
        .with_burst(10_000)
        .with_class(ClassConfig::new(1).with_max_bandwidth(ceil).with_burst(1_000))
        .with_class(ClassConfig::new(2));
    let pipeline = ShapingPipeline::configured("htb", config, PipelineOptions::default()).unwrap();
    pipeline.start().unwrap();

    let start = Instant::now();
    for id in 0..4 {
        assert!(pipeline.enqueue_packet(packet(id, 500, 1)).unwrap().is_queued());
    }

    for expected in 0..4u64 {
        let shaped = pipeline.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(shaped.id(), expected);

        // Two packets fit the ceil burst, then one every 500ms.
        let due = Duration::from_millis(500 * expected.saturating_sub(1));
        let elapsed = start.elapsed();
        assert!(elapsed >= due, "packet {expected} left at {elapsed:?}, due {due:?}");
        assert!(elapsed < due + Duration::from_millis(20), "packet {expected} late: {elapsed:?}");
    }

    // A class without a ceil is not held back by its busy neighbour.
    pipeline.enqueue_packet(packet(10, 500, 2)).unwrap();
    let shaped = pipeline.recv_timeout(Duration::from_millis(20)).await.unwrap();
    assert_eq!(shaped.id(), 10);

    let stats = pipeline.statistics();
    assert!(stats.is_drained());
    assert_eq!(stats.class(1).unwrap().dequeued.packets, 4);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn htb_shrunk_ceil_drops_oversized_backlog() {
    let _ = tracing_subscriber::fmt::try_init();

    let ceil = Rate::from_bytes_per_sec(100);
    let class = ClassConfig::new(1).with_max_bandwidth(ceil);
    let config = ShapingConfig::new(Algorithm::Htb, Rate::from_bytes_per_sec(1_000_000))
        .with_burst(10_000)
        .with_class(class.clone().with_burst(1_500));
    let pipeline = ShapingPipeline::configured("htb", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    pipeline.enqueue_packet(packet(0, 1_500, 1)).unwrap();
    pipeline.enqueue_packet(packet(1, 1_500, 1)).unwrap();
    assert_eq!(pipeline.recv().await.map(|p| p.id()), Some(0));

    // Packet 1 can never fit the smaller ceil bucket.
    pipeline.update_class(class.with_burst(1_000)).unwrap();
    assert_eq!(drops.lock().clone(), vec![(1, DropReason::ExceedsBurst)]);

    tokio::time::sleep(Duration::from_secs(3_600)).await;
    let stats = pipeline.statistics();
    assert!(stats.is_drained(), "{stats:?}");
    assert_eq!(stats.drops(DropReason::ExceedsBurst).packets, 1);

    // The class keeps flowing at its ceil.
    pipeline.enqueue_packet(packet(2, 500, 1)).unwrap();
    assert_eq!(pipeline.recv_timeout(Duration::from_secs(10)).await.map(|p| p.id()), Some(2));
    assert!(pipeline.statistics().is_drained());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_last_handle_discards_backlog() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = ShapingConfig::new(Algorithm::TokenBucket, Rate::from_bytes_per_sec(1_000))
        .with_burst(1_000)
        .with_class(ClassConfig::new(1));
    let pipeline = ShapingPipeline::configured("tbf", config, PipelineOptions::default()).unwrap();
    let drops = record_drops(&pipeline);
    pipeline.start().unwrap();

    for id in 0..4 {
        pipeline.enqueue_packet(packet(id, 1_000, 1)).unwrap();
    }
    assert_eq!(pipeline.recv().await.map(|p| p.id()), Some(0));

    drop(pipeline);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let drops = drops.lock().clone();
    assert_eq!(
        drops,
        vec![(1, DropReason::Shutdown), (2, DropReason::Shutdown), (3, DropReason::Shutdown)]
    );
}

#[tokio::test]
async fn emit_hook_yields_to_other_tasks() {
    let _ = tracing_subscriber::fmt::try_init();

    const PACKETS: usize = 1_000;

    let config = ShapingConfig::new(Algorithm::Drr, Rate::from_bytes_per_sec(1_000_000_000))
        .with_burst(1_000_000_000)
        .with_class(ClassConfig::new(1).with_max_queue_packets(PACKETS));
    let pipeline = ShapingPipeline::configured("hook", config, PipelineOptions::default()).unwrap();

    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&emitted);
    pipeline.set_emit_hook(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    pipeline.start().unwrap();

    for id in 0..PACKETS as u64 {
        pipeline.enqueue_packet(packet(id, 100, 1)).unwrap();
    }

    // Spawned after the driver, so it only runs once the driver gives up the thread.
    let observed = Arc::clone(&emitted);
    let seen = tokio::spawn(async move { observed.load(Ordering::Relaxed) }).await.unwrap();
    assert!(seen < PACKETS, "driver emitted all {seen} packets without yielding");

    while emitted.load(Ordering::Relaxed) < PACKETS {
        tokio::task::yield_now().await;
    }
    assert!(pipeline.statistics().is_drained());

    pipeline.stop().await;
}
