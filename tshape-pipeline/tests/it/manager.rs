use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tshape_pipeline::{
    ManagerError, PipelineError, PipelineState, ShaperManager, ShapingConfig, Verdict,
};
use tshape_sched::{Algorithm, ClassConfig, ConfigError, DropReason, Packet, Rate};

fn wfq(rate: u64, burst: u64) -> ShapingConfig {
    ShapingConfig::new(Algorithm::Wfq, Rate::from_bytes_per_sec(rate))
        .with_burst(burst)
        .with_class(ClassConfig::new(1))
        .with_class(ClassConfig::new(2).with_weight(2))
        .with_default_class(1)
}

#[tokio::test]
async fn registry_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();

    let manager = ShaperManager::new();
    manager.add_pipeline("eth1", wfq(1_000_000, 100_000)).unwrap();
    manager.add_pipeline("eth0", wfq(1_000_000, 100_000)).unwrap();

    assert!(matches!(
        manager.add_pipeline("eth0", wfq(1_000, 10_000)),
        Err(ManagerError::PipelineExists(name)) if name == "eth0"
    ));
    assert_eq!(manager.pipeline_names(), vec!["eth0", "eth1"]);
    assert_eq!(manager.get_pipeline("eth1").unwrap().state(), PipelineState::Configured);
    assert!(manager.get_pipeline("wlan0").is_none());

    // A rejected configuration leaves nothing behind.
    let invalid = wfq(1_000, 10_000).with_class(ClassConfig::new(3).with_weight(0));
    assert!(matches!(
        manager.add_pipeline("bad", invalid),
        Err(ManagerError::Pipeline(PipelineError::Config(ConfigError::ZeroWeight(3))))
    ));
    assert!(manager.get_pipeline("bad").is_none());

    assert!(matches!(
        manager.process_packet("eth0", Packet::new(100)),
        Err(ManagerError::Pipeline(PipelineError::NotRunning(PipelineState::Configured)))
    ));
    assert!(matches!(
        manager.process_packet("wlan0", Packet::new(100)),
        Err(ManagerError::PipelineNotFound(name)) if name == "wlan0"
    ));

    let stats = manager.remove_pipeline("eth1").await.unwrap();
    assert_eq!(stats.name, "eth1");
    assert!(matches!(
        manager.remove_pipeline("eth1").await,
        Err(ManagerError::PipelineNotFound(_))
    ));
    assert_eq!(manager.pipeline_names(), vec!["eth0"]);
}

#[tokio::test(start_paused = true)]
async fn shapes_and_discards_on_stop() {
    let _ = tracing_subscriber::fmt::try_init();

    let manager = ShaperManager::new();
    let drops = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drops);
    manager.set_drop_hook(move |packet, name, reason| {
        sink.lock().push((name.to_string(), packet.id(), reason))
    });

    manager.add_pipeline("eth0", wfq(1_000, 1_000)).unwrap();
    manager.start().unwrap();
    assert!(manager.is_running());

    for id in 0..5 {
        let verdict = manager.process_packet("eth0", Packet::new(500).with_id(id).with_class(2));
        assert_eq!(verdict.unwrap(), Verdict::Queued { class_id: 2 });
    }

    let timeout = Duration::from_millis(100);
    for expected in 0..2 {
        let shaped = manager.get_processed_packet("eth0", timeout).await.unwrap();
        assert_eq!(shaped.map(|p| p.id()), Some(expected));
    }
    // The burst is spent and 100ms only refill 100 bytes.
    assert!(manager.get_processed_packet("eth0", timeout).await.unwrap().is_none());

    manager.stop().await;
    assert!(!manager.is_running());

    let stats = manager.statistics();
    assert_eq!(stats.dequeued.packets, 2);
    assert_eq!(stats.drops(DropReason::Shutdown).packets, 3);
    assert_eq!(stats.dequeued.bytes + stats.dropped.bytes, stats.received.bytes);
    assert_eq!(stats.backlog.packets, 0);

    assert_eq!(*drops.lock(), vec![
        ("eth0".to_string(), 2, DropReason::Shutdown),
        ("eth0".to_string(), 3, DropReason::Shutdown),
        ("eth0".to_string(), 4, DropReason::Shutdown),
    ]);

    assert!(matches!(
        manager.process_packet("eth0", Packet::new(100)),
        Err(ManagerError::Pipeline(PipelineError::NotRunning(PipelineState::Stopped)))
    ));
}

#[tokio::test(start_paused = true)]
async fn pipelines_added_while_running_start() {
    let _ = tracing_subscriber::fmt::try_init();

    let manager = ShaperManager::new();
    manager.start().unwrap();

    let late = manager.add_pipeline("late", wfq(1_000_000, 100_000)).unwrap();
    assert!(late.is_running());

    manager.process_packet("late", Packet::new(100).with_id(7).with_class(1)).unwrap();
    let shaped = manager.get_processed_packet("late", Duration::from_millis(50)).await.unwrap();
    assert_eq!(shaped.map(|p| p.id()), Some(7));

    manager.stop().await;
    assert_eq!(late.state(), PipelineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn aggregates_and_forwards() {
    let _ = tracing_subscriber::fmt::try_init();

    let manager = ShaperManager::new();
    manager.add_pipeline("a", wfq(1_000_000, 100_000)).unwrap();
    manager.add_pipeline("b", wfq(1_000_000, 100_000)).unwrap();
    manager.start().unwrap();

    for id in 0..3 {
        manager.process_packet("a", Packet::new(100).with_id(id).with_class(2)).unwrap();
    }
    // Class 9 does not exist: routed to the default class.
    for id in 0..2 {
        let verdict = manager.process_packet("b", Packet::new(200).with_id(id).with_class(9));
        assert_eq!(verdict.unwrap(), Verdict::Queued { class_id: 1 });
    }

    let timeout = Duration::from_millis(50);
    while manager.get_processed_packet("a", timeout).await.unwrap().is_some() {}
    while manager.get_processed_packet("b", timeout).await.unwrap().is_some() {}

    let stats = manager.statistics();
    assert_eq!(stats.received.packets, 5);
    assert_eq!(stats.dequeued.bytes, 700);
    assert_eq!(stats.pipeline("a").unwrap().received.packets, 3);
    assert_eq!(stats.pipeline("b").unwrap().class(1).unwrap().dequeued.packets, 2);
    assert_eq!(
        stats.pipelines.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    manager.set_rate("a", Rate::from_bytes_per_sec(10)).unwrap();
    let config = manager.get_pipeline("a").unwrap().config().unwrap();
    assert_eq!(config.rate, Rate::from_bytes_per_sec(10));
    assert!(matches!(
        manager.set_rate("a", Rate::ZERO),
        Err(ManagerError::Pipeline(PipelineError::Config(ConfigError::ZeroRate)))
    ));
    assert!(matches!(manager.set_burst("zzz", 1_000), Err(ManagerError::PipelineNotFound(_))));

    manager.add_class("a", ClassConfig::new(5)).unwrap();
    manager.update_class("a", ClassConfig::new(5).with_weight(3)).unwrap();
    assert!(matches!(
        manager.add_class("a", ClassConfig::new(5)),
        Err(ManagerError::Pipeline(PipelineError::Config(ConfigError::DuplicateClass(5))))
    ));
    manager.remove_class("a", 5).unwrap();
    assert!(matches!(
        manager.remove_class("a", 1),
        Err(ManagerError::Pipeline(PipelineError::Config(ConfigError::DefaultClassRemoval(1))))
    ));

    manager.reset_statistics();
    let stats = manager.statistics();
    assert_eq!(stats.received.packets, 0);
    assert_eq!(stats.dropped.packets, 0);

    manager.stop().await;
}
