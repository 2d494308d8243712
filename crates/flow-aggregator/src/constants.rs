// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Seconds of sustained, configured-rate traffic the queue absorbs before it starts dropping.
pub const MAX_FLOW_BUFFER_SECONDS: u64 = 8;

/// Smallest backing array a queue keeps, grown lazily from here.
pub const MIN_QUEUE_LEN: usize = 16;

/// Inbound sample rates are scaled by this factor on the way out.
pub const SAMPLE_RATE_SCALE: u32 = 100;

/// Construction errors beyond this many undrained are dropped.
pub const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Built messages waiting for the consumer. Small on purpose: a full channel blocks dispatch.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1;

/// Upper bound on the encoded size of a single outbound message.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FLOWS_PER_SECOND: u32 = 1_000;
