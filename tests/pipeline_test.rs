//! End-to-end tests exercising client -> ring buffer -> aggregator and
//! pattern -> scheduler wiring without spawning real worker subprocesses
//! (the coordinator's process-fleet management is covered by its own
//! in-module tests).

use std::sync::Arc;
use std::time::Duration;

use loadforge::aggregator::Aggregator;
use loadforge::client::{build_client, ClientConfig, LoadClient};
use loadforge::label_registry::label_channel;
use loadforge::pattern::Pattern;
use loadforge::ring_buffer::RingBufferProducer;
use loadforge::scheduler::Scheduler;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn requests_flow_from_client_through_ring_buffer_into_a_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let ring_path = dir.path().join("worker-0.ring");
    let producer = Arc::new(RingBufferProducer::create(&ring_path, 0).unwrap());

    let producer_for_sink = producer.clone();
    let on_complete: loadforge::client::MetricSink = Arc::new(move |metric| {
        producer_for_sink.push(&metric);
    });
    let (label_tx, mut label_rx) = label_channel();

    let build = build_client(&ClientConfig::default()).unwrap();
    let client = LoadClient::new(build.client, server.uri(), 0, on_complete, label_tx);

    client.get("/ok", "ok_endpoint").await.unwrap();
    client.get("/ok", "ok_endpoint").await.unwrap();
    client.get("/broken", "broken_endpoint").await.unwrap();

    // Drain the in-process label channel straight into the mailbox file the
    // aggregator reads, mirroring what the worker's forwarding task does.
    let mailbox_path = loadforge::label_registry::label_mailbox_path(&ring_path);
    let mut writer = loadforge::label_registry::LabelMailboxWriter::create(&mailbox_path).unwrap();
    while let Ok(label) = label_rx.try_recv() {
        writer.write(&label).unwrap();
    }

    let mut aggregator = Aggregator::open(&[ring_path]).unwrap();
    let snapshot = aggregator.tick(1.0, 10, 2);

    assert_eq!(snapshot.requests_this_tick, 3);
    assert_eq!(snapshot.errors_this_tick, 1);
    assert!(snapshot.endpoints.contains_key("ok_endpoint"));
    assert!(snapshot.endpoints.contains_key("broken_endpoint"));
    assert_eq!(snapshot.endpoints["ok_endpoint"].requests, 2);
    assert_eq!(snapshot.endpoints["broken_endpoint"].errors, 1);
    assert_eq!(snapshot.dropped_records, 0);

    // A second tick with no new traffic should report a clean, empty slate.
    let second = aggregator.tick(2.0, 10, 2);
    assert_eq!(second.requests_this_tick, 0);
    assert_eq!(second.total_requests, 3);
}

#[tokio::test]
async fn ramp_pattern_drives_scheduler_ticks_to_expected_targets() {
    let pattern = Pattern::Ramp {
        start: 0,
        end: 10,
        ramp_duration: 2.0,
    };
    let scheduler = Scheduler::new(pattern, Duration::from_secs(2), Duration::from_millis(500));

    let mut seen = Vec::new();
    scheduler
        .run(|tick| {
            seen.push(tick.target_concurrency);
        })
        .await;

    assert!(seen.len() >= 4, "expected at least 4 ticks, got {}", seen.len());
    assert_eq!(*seen.first().unwrap(), 0);
    assert_eq!(*seen.last().unwrap(), 10);
    assert!(seen.windows(2).all(|w| w[1] >= w[0]), "ramp must be non-decreasing");
}

#[tokio::test]
async fn constant_pattern_config_round_trips_through_validation() {
    let mut config = loadforge::config::Config::for_testing();
    config.pattern = Pattern::Constant(50);
    config.max_concurrency = 100;
    config.test_duration = Duration::from_secs(5);
    config.tick_interval = Duration::from_secs(1);

    let client_config = config.to_client_config();
    assert_eq!(client_config.request_timeout, Some(config.request_timeout));
}
