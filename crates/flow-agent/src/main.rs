// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use flow_aggregator::{
    aggregator_service::{AggregatorHandle, AggregatorOutput, AggregatorService},
    config::AggregatorConfig,
    errors::MessageError,
    flow::FlowRecord,
    message::FlowMessage,
    metrics::CountingMetrics,
};

const DEFAULT_LOG_LEVEL: &str = "info";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[tokio::main]
pub async fn main() {
    let requested_level = env::var("FLOW_AGG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or(DEFAULT_LOG_LEVEL.to_string());
    let log_level = if VALID_LOG_LEVELS.contains(&requested_level.as_str()) {
        requested_level.as_str()
    } else {
        DEFAULT_LOG_LEVEL
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(log_level))
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return;
    }

    if log_level != requested_level {
        warn!(
            "Invalid log level '{requested_level}'. Must be one of: {}. Using '{DEFAULT_LOG_LEVEL}'",
            VALID_LOG_LEVELS.join(", ")
        );
    }
    debug!("Logging subsystem enabled");

    let config = match AggregatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading flow aggregator configuration: {e}");
            return;
        }
    };

    let metrics = Arc::new(CountingMetrics::default());
    let (service, handle, output) =
        match AggregatorService::from_config(config.clone(), metrics.clone()) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Error creating flow aggregator: {e}");
                return;
            }
        };

    info!(
        interval = ?config.interval,
        flows_per_second = config.flows_per_second,
        batch_size = config.batch_size(),
        queue_capacity = config.queue_capacity(),
        "Starting flow aggregator"
    );

    let service_task = tokio::spawn(service.run());
    let AggregatorOutput {
        messages,
        errors,
        shutdown,
    } = output;
    let consumer = tokio::spawn(consume_messages(messages));
    tokio::spawn(report_errors(errors));

    let read = read_flows(tokio::io::stdin(), &handle).await;
    debug!("Input closed after {read} flows, stopping flow aggregator");

    shutdown.stop().await;
    match consumer.await {
        Ok((messages, flows)) => info!("Consumed {messages} messages carrying {flows} flows"),
        Err(e) => error!("Message consumer failed: {e}"),
    }
    if let Err(e) = service_task.await {
        error!("Flow aggregator service failed: {e}");
    }

    info!("Flow aggregator stopped: {}", metrics.snapshot());
}

/// Feeds newline-delimited JSON flows into the aggregator until EOF. Returns the number of flows
/// handed over.
async fn read_flows<R>(reader: R, handle: &AggregatorHandle) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut added = 0;
    let mut line_number = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read flows from input: {e}");
                break;
            }
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<FlowRecord>(&line) {
            Ok(flow) => {
                handle.add(flow);
                added += 1;
            }
            Err(e) => warn!("Skipping malformed flow on line {line_number}: {e}"),
        }
    }

    added
}

/// Stands in for the upstream transport: logs each message and counts what went by.
async fn consume_messages(mut messages: mpsc::Receiver<FlowMessage>) -> (usize, usize) {
    let mut count = 0;
    let mut flows = 0;
    while let Some(message) = messages.recv().await {
        count += 1;
        flows += message.flows;
        info!(
            flows = message.flows,
            bytes = message.payload.len(),
            encoding = %message.encoding,
            "Flow message ready"
        );
    }
    (count, flows)
}

async fn report_errors(mut errors: mpsc::Receiver<MessageError>) {
    while let Some(e) = errors.recv().await {
        error!("Flow message construction failed: {e}");
    }
}
