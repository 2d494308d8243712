// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use flow_aggregator::{
    aggregator_service::{AggregatorHandle, AggregatorOutput, AggregatorService, ServiceState},
    config::AggregatorConfig,
    flow::{Custom, CustomValue, FlowRecord},
    message::{Encoding, FlowMessage},
    metrics::CountingMetrics,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Duration},
};

const WAIT: Duration = Duration::from_secs(5);

fn flow(tag: u32, sample_rate: u32) -> FlowRecord {
    FlowRecord {
        device_id: tag,
        sample_rate,
        in_bytes: u64::from(tag) * 1_500,
        customs: vec![
            Custom {
                id: 1,
                value: CustomValue::Str(format!("site-{tag}")),
                is_dimension: true,
            },
            Custom {
                id: 2,
                value: CustomValue::Float32(tag as f32 / 2.0),
                is_dimension: false,
            },
        ],
        ..Default::default()
    }
}

fn start(
    config: AggregatorConfig,
    metrics: Arc<CountingMetrics>,
) -> (AggregatorHandle, AggregatorOutput, AggregatorService) {
    let (service, handle, output) =
        AggregatorService::from_config(config, metrics).expect("failed to create aggregator");
    (handle, output, service)
}

fn spawn_consumer(
    mut messages: mpsc::Receiver<FlowMessage>,
) -> JoinHandle<Vec<Vec<FlowRecord>>> {
    tokio::spawn(async move {
        let mut batches = Vec::new();
        while let Some(message) = messages.recv().await {
            batches.push(message.decode().expect("failed to decode message"));
        }
        batches
    })
}

#[tokio::test]
async fn steady_state_ticks_never_adjust() {
    let metrics = Arc::new(CountingMetrics::default());
    let (handle, output, service) = start(
        AggregatorConfig {
            interval: Duration::from_millis(100),
            flows_per_second: 100,
            compression_level: None,
        },
        metrics.clone(),
    );
    let service_task = tokio::spawn(service.run());
    let AggregatorOutput {
        mut messages,
        shutdown,
        ..
    } = output;

    // One interval's worth per round. The adds never yield, so each round lands in a single tick.
    for round in 0..3u32 {
        for i in 0..10 {
            handle.add(flow(round * 10 + i, 3));
        }
        let message = timeout(WAIT, messages.recv())
            .await
            .expect("no message before timeout")
            .expect("channel closed early");
        let flows = message.decode().expect("failed to decode message");
        assert_eq!(flows.len(), 10);
        for (i, received) in flows.iter().enumerate() {
            let mut expected = flow(round * 10 + i as u32, 3);
            expected.sample_rate = 300;
            expected.sample_adj = true;
            assert_eq!(received, &expected);
        }
    }

    timeout(WAIT, shutdown.stop()).await.expect("stop timed out");
    assert!(messages.recv().await.is_none());
    service_task.await.expect("service failed");

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.flows_dropped, 0);
    assert_eq!(snapshot.flows_in, 30);
    assert_eq!(snapshot.flows_out, 30);
    assert_eq!(snapshot.new_sample_rate.min, 300);
    assert_eq!(snapshot.new_sample_rate.max, 300);
}

#[tokio::test]
async fn overload_compensates_for_drops_in_compressed_messages() {
    let metrics = Arc::new(CountingMetrics::default());
    let (handle, output, service) = start(
        AggregatorConfig {
            interval: Duration::from_millis(100),
            flows_per_second: 100,
            compression_level: Some(3),
        },
        metrics.clone(),
    );

    // Mixed inbound rates: every survivor gets its own rate scaled by the same factor.
    for tag in 0..280 {
        handle.add(flow(tag, 1 + tag % 4));
    }

    let service_task = tokio::spawn(service.run());
    let AggregatorOutput {
        mut messages,
        shutdown,
        ..
    } = output;

    let message = timeout(WAIT, messages.recv())
        .await
        .expect("no message before timeout")
        .expect("channel closed early");
    assert_eq!(message.encoding, Encoding::PackedZstd);
    assert_eq!(message.flows, 80);

    let flows = message.decode().expect("failed to decode message");
    let rate_adjustment = 280.0 / 80.0;
    for (tag, received) in flows.iter().enumerate() {
        let original = flow(tag as u32, 1 + tag as u32 % 4);
        assert_eq!(
            received.sample_rate,
            (f64::from(original.sample_rate * 100) * rate_adjustment) as u32
        );
        assert!(received.sample_adj);
        assert_eq!(received.customs, original.customs);
        assert_eq!(received.in_bytes, original.in_bytes);
    }

    timeout(WAIT, shutdown.stop()).await.expect("stop timed out");
    assert!(messages.recv().await.is_none());
    service_task.await.expect("service failed");
    assert_eq!(metrics.snapshot().flows_dropped, 200);
}

#[tokio::test]
async fn reconfigure_while_running() {
    let metrics = Arc::new(CountingMetrics::default());
    let (handle, output, service) = start(
        AggregatorConfig {
            interval: Duration::from_millis(100),
            flows_per_second: 10,
            compression_level: None,
        },
        metrics.clone(),
    );
    let service_task = tokio::spawn(service.run());
    let AggregatorOutput {
        messages, shutdown, ..
    } = output;
    let consumer = spawn_consumer(messages);

    assert_eq!(handle.queue_capacity(), 8);
    for tag in 0..5 {
        handle.add(flow(tag, 1));
    }
    handle.configure(1_000).expect("configure failed");
    assert_eq!(handle.batch_size(), 100);

    for tag in 100..150 {
        handle.add(flow(tag, 1));
    }

    timeout(WAIT, shutdown.stop()).await.expect("stop timed out");
    assert_eq!(handle.state(), ServiceState::Stopped);
    let batches = consumer.await.expect("consumer failed");
    service_task.await.expect("service failed");

    let tags: Vec<u32> = batches
        .into_iter()
        .flatten()
        .map(|flow| flow.device_id)
        .collect();
    assert_eq!(tags, (100..150).collect::<Vec<_>>());
    assert_eq!(metrics.snapshot().flows_dropped, 0);
}
