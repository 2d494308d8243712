// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{DEFAULT_FLOWS_PER_SECOND, DEFAULT_INTERVAL, MAX_FLOW_BUFFER_SECONDS};
use crate::errors::ConfigError;
use std::env;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Configuration for the flow aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Time between dispatch ticks
    pub interval: Duration,
    /// Sustained flow rate the aggregator is sized for
    pub flows_per_second: u32,
    /// zstd level for outbound messages, `None` to ship them uncompressed
    pub compression_level: Option<i32>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            flows_per_second: DEFAULT_FLOWS_PER_SECOND,
            compression_level: None,
        }
    }
}

impl AggregatorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let interval = parse_var(&lookup, "FLOW_AGG_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval);
        let flows_per_second =
            parse_var(&lookup, "FLOW_AGG_FLOWS_PER_SECOND")?.unwrap_or(defaults.flows_per_second);
        let compression_level = parse_var(&lookup, "FLOW_AGG_COMPRESSION_LEVEL")?;

        let config = Self {
            interval,
            flows_per_second,
            compression_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "dispatch interval must be greater than 0".to_string(),
            ));
        }

        if self.flows_per_second == 0 {
            return Err(ConfigError::Invalid(
                "flows per second must be greater than 0".to_string(),
            ));
        }

        if let Some(level) = self.compression_level {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(ConfigError::Invalid(format!(
                    "compression level {level} outside {}..={}",
                    range.start(),
                    range.end()
                )));
            }
        }

        Ok(())
    }

    /// Flows dispatched per tick: the configured rate spread over one interval, at least one.
    pub fn batch_size(&self) -> usize {
        batch_size(self.flows_per_second, self.interval)
    }

    /// Flows buffered before the queue starts dropping.
    pub fn queue_capacity(&self) -> usize {
        queue_capacity(self.flows_per_second, self.interval)
    }
}

pub(crate) fn batch_size(flows_per_second: u32, interval: Duration) -> usize {
    per_interval(u128::from(flows_per_second), interval).max(1)
}

pub(crate) fn queue_capacity(flows_per_second: u32, interval: Duration) -> usize {
    let buffered = u128::from(flows_per_second) * u128::from(MAX_FLOW_BUFFER_SECONDS);
    per_interval(buffered, interval).max(batch_size(flows_per_second, interval))
}

fn per_interval(per_second: u128, interval: Duration) -> usize {
    let n = per_second * interval.as_nanos() / NANOS_PER_SEC;
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse { name, value }),
    }
}
