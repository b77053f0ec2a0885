use std::time::{Duration, Instant};

use bytes::Bytes;

use tshape::{
    Algorithm, ClassConfig, DscpClassifier, Packet, Rate, ShaperManager, ShapingConfig,
};

const VOICE: u32 = 1;
const VIDEO: u32 = 2;
const BULK: u32 = 3;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // A 1 Mbit/s uplink shared by three classes with a 4:2:1 weighting.
    let config = ShapingConfig::new(Algorithm::Wfq, Rate::from_mbit_per_sec(1.0))
        .with_burst(16 * 1024)
        .with_class(ClassConfig::new(VOICE).with_name("voice").with_weight(4))
        .with_class(ClassConfig::new(VIDEO).with_name("video").with_weight(2))
        .with_class(ClassConfig::new(BULK).with_name("bulk").with_max_queue_packets(200))
        .with_classifier(DscpClassifier::diffserv(VOICE, VIDEO, VIDEO, BULK))
        .with_default_class(BULK);

    let manager = ShaperManager::new();
    manager.set_drop_hook(|packet, pipeline, reason| {
        println!("{pipeline}: dropped packet {} ({reason})", packet.id());
    });
    manager.add_pipeline("uplink", config).unwrap();
    manager.start().unwrap();

    // Offer three flows at once: EF voice, AF41 video and best effort bulk.
    let payload = Bytes::from(vec![0u8; 1_000]);
    for id in 0..600u64 {
        let dscp = match id % 3 {
            0 => 46,
            1 => 34,
            _ => 0,
        };
        let packet = Packet::from_payload(payload.clone()).with_id(id).with_dscp(dscp);
        manager.process_packet("uplink", packet).unwrap();
    }

    let start = Instant::now();
    let mut shaped = 0;
    while let Some(packet) =
        manager.get_processed_packet("uplink", Duration::from_millis(500)).await.unwrap()
    {
        shaped += 1;
        if shaped % 100 == 0 {
            println!(
                "{shaped} packets after {:?}, last from class {:?}",
                start.elapsed(),
                packet.class_id()
            );
        }
        if start.elapsed() > Duration::from_secs(2) {
            break;
        }
    }

    manager.stop().await;

    let stats = manager.statistics();
    for pipeline in &stats.pipelines {
        println!("pipeline {} ({})", pipeline.name, pipeline.state);
        for class in &pipeline.classes {
            println!(
                "  class {} {:<6} enqueued {:>4} sent {:>4} dropped {:>4}",
                class.class_id,
                class.name.as_deref().unwrap_or("-"),
                class.enqueued.packets,
                class.dequeued.packets,
                class.dropped.packets,
            );
        }
    }
}
