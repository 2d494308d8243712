// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal metrics reported by the aggregator.
//!
//! The aggregator only talks to a [`MetricsSink`]; where the numbers end up is the embedder's
//! business. [`CountingMetrics`] keeps everything in relaxed atomics so a caller can expose it
//! through whatever backend it already has, or just log a [`MetricsSnapshot`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Flows handed to the aggregator, accepted or not.
    FlowsIn,
    /// Flows delivered to the consumer.
    FlowsOut,
    /// Flows rejected by a full queue.
    FlowsDropped,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlowsIn => "flows.in",
            Self::FlowsOut => "flows.out",
            Self::FlowsDropped => "flows.dropped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Histogram {
    /// Sample rate as received from the producer.
    OrigSampleRate,
    /// Sample rate after scaling and drop compensation.
    NewSampleRate,
}

impl Histogram {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OrigSampleRate => "sample_rate.orig",
            Self::NewSampleRate => "sample_rate.new",
        }
    }
}

/// Destination for the aggregator's internal metrics.
///
/// Implementations must be thread safe and must not block; they are called from producers and
/// from the dispatch loop without any aggregator lock held.
pub trait MetricsSink: Send + Sync {
    /// Marks `n` occurrences of `counter`.
    fn mark(&self, counter: Counter, n: u64);

    /// Records one sample of `histogram`.
    fn record(&self, histogram: Histogram, value: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn mark(&self, _counter: Counter, _n: u64) {}

    fn record(&self, _histogram: Histogram, _value: u64) {}
}

#[derive(Debug)]
struct Distribution {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for Distribution {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }
}

impl Distribution {
    fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DistributionSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        DistributionSnapshot {
            count,
            sum: self.sum.load(Ordering::Relaxed),
            min: if count == 0 {
                0
            } else {
                self.min.load(Ordering::Relaxed)
            },
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Metrics sink backed by relaxed atomics.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    flows_in: AtomicU64,
    flows_out: AtomicU64,
    flows_dropped: AtomicU64,
    orig_sample_rate: Distribution,
    new_sample_rate: Distribution,
}

impl CountingMetrics {
    /// Captures a point-in-time snapshot of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flows_in: self.flows_in.load(Ordering::Relaxed),
            flows_out: self.flows_out.load(Ordering::Relaxed),
            flows_dropped: self.flows_dropped.load(Ordering::Relaxed),
            orig_sample_rate: self.orig_sample_rate.snapshot(),
            new_sample_rate: self.new_sample_rate.snapshot(),
        }
    }
}

impl MetricsSink for CountingMetrics {
    fn mark(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::FlowsIn => &self.flows_in,
            Counter::FlowsOut => &self.flows_out,
            Counter::FlowsDropped => &self.flows_dropped,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    fn record(&self, histogram: Histogram, value: u64) {
        match histogram {
            Histogram::OrigSampleRate => self.orig_sample_rate.record(value),
            Histogram::NewSampleRate => self.new_sample_rate.record(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub sum: u64,
    /// Zero when nothing was recorded.
    pub min: u64,
    pub max: u64,
}

impl DistributionSnapshot {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// Plain data representation of [`CountingMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub flows_in: u64,
    pub flows_out: u64,
    pub flows_dropped: u64,
    pub orig_sample_rate: DistributionSnapshot,
    pub new_sample_rate: DistributionSnapshot,
}

impl fmt::Display for MetricsSnapshot {
    /// Formats the snapshot as `name=value` pairs for log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}, {}={}, {}={}",
            Counter::FlowsIn.name(),
            self.flows_in,
            Counter::FlowsOut.name(),
            self.flows_out,
            Counter::FlowsDropped.name(),
            self.flows_dropped
        )?;
        for (histogram, snapshot) in [
            (Histogram::OrigSampleRate, self.orig_sample_rate),
            (Histogram::NewSampleRate, self.new_sample_rate),
        ] {
            write!(
                f,
                ", {name}.count={}, {name}.min={}, {name}.max={}",
                snapshot.count,
                snapshot.min,
                snapshot.max,
                name = histogram.name()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_accumulate() {
        let metrics = CountingMetrics::default();
        metrics.mark(Counter::FlowsIn, 5);
        metrics.mark(Counter::FlowsIn, 3);
        metrics.mark(Counter::FlowsDropped, 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.flows_in, 8);
        assert_eq!(snapshot.flows_out, 0);
        assert_eq!(snapshot.flows_dropped, 2);
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = CountingMetrics::default();
        assert_eq!(metrics.snapshot().new_sample_rate, DistributionSnapshot::default());
        assert_eq!(metrics.snapshot().new_sample_rate.mean(), None);

        for value in [100, 350, 200] {
            metrics.record(Histogram::NewSampleRate, value);
        }

        let snapshot = metrics.snapshot().new_sample_rate;
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.sum, 650);
        assert_eq!(snapshot.min, 100);
        assert_eq!(snapshot.max, 350);
        assert_eq!(metrics.snapshot().orig_sample_rate.count, 0);
    }

    #[test]
    fn test_concurrent_marks() {
        let metrics = Arc::new(CountingMetrics::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.mark(Counter::FlowsOut, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(metrics.snapshot().flows_out, 4_000);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = CountingMetrics::default();
        metrics.mark(Counter::FlowsIn, 1);
        metrics.record(Histogram::OrigSampleRate, 4);

        let line = metrics.snapshot().to_string();
        assert!(line.starts_with("flows.in=1, flows.out=0, flows.dropped=0"));
        assert!(line.contains("sample_rate.orig.count=1, sample_rate.orig.min=4, sample_rate.orig.max=4"));
        assert!(line.contains("sample_rate.new.count=0, sample_rate.new.min=0"));
    }
}
