// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic flow aggregator.
//!
//! ```text
//!    ┌──────────────┐
//!    │   Handles    │  add(): any number of producers, never blocks on I/O
//!    └──────┬───────┘
//!           │ one mutex, O(1) per flow
//!           v
//!    ┌──────────────┐
//!    │  FlowQueue   │  bounded, drop-newest
//!    └──────┬───────┘
//!           │ one batch per tick
//!           v
//!    ┌──────────────┐
//!    │   Service    │  single run loop: adjust sample rates, build message
//!    └──────┬───────┘
//!           │ bounded channel, blocking send
//!           v
//!    ┌──────────────┐
//!    │   Consumer   │
//!    └──────────────┘
//! ```
//!
//! Overload is handled in two tiers. Producers never wait on the consumer: once the queue is
//! full their flows are counted as drops and the survivors' sample rates are scaled up to
//! compensate. The run loop, on the other hand, waits for the consumer to take each message, so
//! it never races ahead of a slow downstream.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let (service, handle, output) =
//!     AggregatorService::from_config(AggregatorConfig::default(), Arc::new(NoopMetrics))?;
//! tokio::spawn(service.run());
//!
//! handle.add(flow);
//!
//! let AggregatorOutput { mut messages, shutdown, .. } = output;
//! tokio::spawn(async move {
//!     while let Some(message) = messages.recv().await {
//!         ship(message).await;
//!     }
//! });
//!
//! shutdown.stop().await;
//! ```

use crate::config::{self, AggregatorConfig};
use crate::constants::{ERROR_CHANNEL_CAPACITY, OUTPUT_CHANNEL_CAPACITY, SAMPLE_RATE_SCALE};
use crate::errors::{self, ConfigError, MessageError};
use crate::flow::FlowRecord;
use crate::message::{FlowMessage, MessageBuilder, PackedMessageBuilder};
use crate::metrics::{Counter, Histogram, MetricsSink};
use crate::queue::FlowQueue;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the run loop. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopping,
    Stopped,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct State {
    queue: FlowQueue<FlowRecord>,
    /// Flows handed to `add` since the last dispatch, accepted or not.
    queued: u64,
    batch_size: usize,
}

struct Shared {
    state: Mutex<State>,
    lifecycle: AtomicU8,
    interval: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Nothing in the critical sections can leave `State` half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, state: ServiceState) {
        self.lifecycle.store(state as u8, Ordering::Release);
    }
}

/// Producer and control side of the aggregator. Cheap to clone.
#[derive(Clone)]
pub struct AggregatorHandle {
    shared: Arc<Shared>,
}

impl AggregatorHandle {
    /// Hands one flow to the aggregator.
    ///
    /// Never blocks on I/O and never fails: when the queue is full the flow is discarded and
    /// shows up only in the drop count and in the next batch's rate adjustment.
    pub fn add(&self, flow: FlowRecord) {
        let rejected = {
            let mut state = self.shared.lock();
            state.queued += 1;
            state.queue.enqueue(flow).is_err()
        };

        if rejected {
            self.shared.metrics.mark(Counter::FlowsDropped, 1);
        }
    }

    /// Resizes the aggregator for a new sustained flow rate.
    ///
    /// Replaces the queue: flows buffered but not yet dispatched are discarded.
    pub fn configure(&self, flows_per_second: u32) -> Result<(), ConfigError> {
        if flows_per_second == 0 {
            return Err(ConfigError::Invalid(
                "flows per second must be greater than 0".to_string(),
            ));
        }

        let batch_size = config::batch_size(flows_per_second, self.shared.interval);
        let capacity = config::queue_capacity(flows_per_second, self.shared.interval);

        let previous = {
            let mut state = self.shared.lock();
            state.batch_size = batch_size;
            std::mem::replace(&mut state.queue, FlowQueue::new(capacity))
        };

        info!(
            flows_per_second,
            batch_size,
            capacity,
            discarded = previous.len(),
            "Flow aggregator reconfigured"
        );
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.shared.lock().batch_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.lock().queue.max()
    }

    /// Flows currently buffered and waiting for a dispatch tick.
    pub fn buffered(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.shared.lifecycle.load(Ordering::Acquire))
    }
}

/// Consumer side of the aggregator.
pub struct AggregatorOutput {
    /// One message per non-empty dispatch tick. Closed once, after the final flush.
    pub messages: mpsc::Receiver<FlowMessage>,
    /// Best-effort message construction failures. Errors are dropped while this is full.
    pub errors: mpsc::Receiver<MessageError>,
    pub shutdown: Shutdown,
}

/// Stops the run loop. Consumed by [`Shutdown::stop`], so it can only fire once.
pub struct Shutdown {
    cancel_token: CancellationToken,
    done_rx: oneshot::Receiver<()>,
}

impl Shutdown {
    /// Signals the run loop and waits until it has flushed what was queued and closed the
    /// message channel.
    ///
    /// The final flush waits for the consumer like any other tick, so keep draining
    /// [`AggregatorOutput::messages`] while this runs.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        if self.done_rx.await.is_err() {
            warn!("Flow aggregator service exited without acknowledging shutdown");
        }
    }
}

pub struct AggregatorService {
    shared: Arc<Shared>,
    builder: Arc<dyn MessageBuilder>,
    messages_tx: mpsc::Sender<FlowMessage>,
    errors_tx: mpsc::Sender<MessageError>,
    cancel_token: CancellationToken,
    done_tx: oneshot::Sender<()>,
}

impl AggregatorService {
    /// Creates a service that packs its messages with [`PackedMessageBuilder`].
    pub fn from_config(
        config: AggregatorConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<(Self, AggregatorHandle, AggregatorOutput), errors::Creation> {
        let builder = Arc::new(PackedMessageBuilder::new(config.compression_level));
        Self::new(config, metrics, builder)
    }

    /// Returns the service (to be spawned), a handle for producers and the consumer side.
    pub fn new(
        config: AggregatorConfig,
        metrics: Arc<dyn MetricsSink>,
        builder: Arc<dyn MessageBuilder>,
    ) -> Result<(Self, AggregatorHandle, AggregatorOutput), errors::Creation> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: FlowQueue::new(config.queue_capacity()),
                queued: 0,
                batch_size: config.batch_size(),
            }),
            lifecycle: AtomicU8::new(ServiceState::Running as u8),
            interval: config.interval,
            metrics,
        });

        let (messages_tx, messages_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let cancel_token = CancellationToken::new();

        let service = Self {
            shared: Arc::clone(&shared),
            builder,
            messages_tx,
            errors_tx,
            cancel_token: cancel_token.clone(),
            done_tx,
        };
        let handle = AggregatorHandle { shared };
        let output = AggregatorOutput {
            messages: messages_rx,
            errors: errors_rx,
            shutdown: Shutdown {
                cancel_token,
                done_rx,
            },
        };

        Ok((service, handle, output))
    }

    /// Runs the dispatch loop until [`Shutdown::stop`] is called.
    pub async fn run(self) {
        let mut ticker = interval(self.shared.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        debug!(interval = ?self.shared.interval, "Flow aggregator service started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => self.dispatch(Flush::Tick).await,
            }
        }

        debug!("Flow aggregator service shutting down");
        self.dispatch(Flush::Drain).await;
        self.shared.set_lifecycle(ServiceState::Stopping);

        let Self {
            shared,
            messages_tx,
            done_tx,
            ..
        } = self;
        drop(messages_tx);
        shared.set_lifecycle(ServiceState::Stopped);

        debug!("Flow aggregator service stopped");
        if done_tx.send(()).is_err() {
            debug!("Shutdown caller went away before the flow aggregator stopped");
        }
    }

    async fn dispatch(&self, flush: Flush) {
        let (received, batch) = {
            let mut state = self.shared.lock();
            let received = std::mem::take(&mut state.queued);
            let n = match flush {
                Flush::Tick => state.batch_size,
                Flush::Drain => state.queue.len(),
            };
            let capacity = state.queue.max();
            (received, state.queue.dequeue(n, capacity))
        };

        let metrics = &self.shared.metrics;
        metrics.mark(Counter::FlowsIn, received);

        if batch.is_empty() {
            return;
        }

        let rate_adjustment = batch.rate_adjustment;
        if batch.dropped > 0 {
            debug!(
                dropped = batch.dropped,
                retained = batch.len(),
                rate_adjustment,
                "Flow queue overflowed, scaling sample rates"
            );
        }

        let mut flows = batch.records;
        let mut rates = Vec::with_capacity(flows.len());
        for flow in &mut flows {
            let orig = flow.sample_rate;
            flow.sample_rate = adjusted_sample_rate(orig, rate_adjustment);
            flow.sample_adj = true;
            rates.push((orig, flow.sample_rate));
        }

        let count = flows.len();
        let builder = Arc::clone(&self.builder);
        // Packing and compression are CPU-bound, keep them off the runtime workers.
        let message = match tokio::task::spawn_blocking(move || builder.build(&flows)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                error!("Failed to build flow message, dropping {count} flows: {e}");
                // Best effort: nobody is required to drain the error channel.
                let _ = self.errors_tx.try_send(e);
                return;
            }
            Err(e) => {
                error!("Flow message builder task failed, dropping {count} flows: {e}");
                return;
            }
        };

        let sent = message.flows;
        if self.messages_tx.send(message).await.is_err() {
            warn!("Flow message consumer hung up, dropping {sent} flows");
            return;
        }

        metrics.mark(Counter::FlowsOut, sent as u64);
        for (orig, new) in rates {
            metrics.record(Histogram::OrigSampleRate, u64::from(orig));
            metrics.record(Histogram::NewSampleRate, u64::from(new));
        }
    }
}

/// How much of the queue one dispatch takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    /// One batch, or the whole buffer when it has saturated.
    Tick,
    /// Everything still buffered, for the final dispatch at shutdown.
    Drain,
}

/// Scales an inbound sample rate for the outbound message, compensating for drops.
fn adjusted_sample_rate(sample_rate: u32, rate_adjustment: f64) -> u32 {
    let scaled = sample_rate.saturating_mul(SAMPLE_RATE_SCALE);
    if rate_adjustment > 1.0 {
        // float-to-int `as` saturates
        (f64::from(scaled) * rate_adjustment) as u32
    } else {
        scaled
    }
}
