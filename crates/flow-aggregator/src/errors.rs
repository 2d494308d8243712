// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Returned by [`crate::queue::FlowQueue::enqueue`] when the queue is at capacity.
///
/// This is the routine backpressure signal, not a failure. Each queue builds one value at
/// creation time and hands out copies of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow queue full: max {max} flows")]
pub struct QueueFull {
    pub max: usize,
}

/// Errors raised while turning a batch of flows into an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to encode flows: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode flows: {0}")]
    Decode(#[source] bincode::Error),

    #[error("failed to compress message: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress message: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value '{value}' for {name}")]
    Parse { name: &'static str, value: String },
}

/// Errors raised when constructing an aggregator service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Creation {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
