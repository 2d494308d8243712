// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound message construction.
//!
//! A message is one self-contained binary container holding every flow of one dispatch tick, in
//! order. The aggregator only depends on [`MessageBuilder`]; [`PackedMessageBuilder`] is the
//! default container: the flows packed with bincode, optionally zstd-compressed.

use crate::constants::MAX_MESSAGE_BYTES;
use crate::errors::MessageError;
use crate::flow::FlowRecord;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Packed,
    PackedZstd,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Packed => write!(f, "packed"),
            Self::PackedZstd => write!(f, "packed+zstd"),
        }
    }
}

/// One outbound batch, ready to ship.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowMessage {
    pub payload: Vec<u8>,
    pub encoding: Encoding,
    /// Number of flows packed in `payload`.
    pub flows: usize,
}

impl FlowMessage {
    /// Unpacks the flows carried by this message.
    pub fn decode(&self) -> Result<Vec<FlowRecord>, MessageError> {
        let packed = match self.encoding {
            Encoding::Packed => Cow::Borrowed(self.payload.as_slice()),
            Encoding::PackedZstd => Cow::Owned(
                zstd::decode_all(self.payload.as_slice()).map_err(MessageError::Decompress)?,
            ),
        };
        let container: PackedFlows<'static> =
            bincode::deserialize(&packed).map_err(MessageError::Decode)?;
        Ok(container.msgs.into_owned())
    }
}

// Wire container. Borrowed on the way out so building never clones the batch.
#[derive(Serialize, Deserialize)]
struct PackedFlows<'a> {
    msgs: Cow<'a, [FlowRecord]>,
}

/// Turns a batch of adjusted flows into an outbound message.
///
/// The aggregator calls `build` on tokio's blocking pool, so implementations may do CPU-heavy or
/// blocking work.
pub trait MessageBuilder: Send + Sync {
    fn build(&self, flows: &[FlowRecord]) -> Result<FlowMessage, MessageError>;
}

#[derive(Debug, Clone)]
pub struct PackedMessageBuilder {
    compression_level: Option<i32>,
    max_bytes: usize,
}

impl Default for PackedMessageBuilder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PackedMessageBuilder {
    /// `compression_level` enables zstd at that level; `None` ships the packed bytes as is.
    pub fn new(compression_level: Option<i32>) -> Self {
        Self {
            compression_level,
            max_bytes: MAX_MESSAGE_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl MessageBuilder for PackedMessageBuilder {
    fn build(&self, flows: &[FlowRecord]) -> Result<FlowMessage, MessageError> {
        let container = PackedFlows {
            msgs: Cow::Borrowed(flows),
        };
        let packed = bincode::serialize(&container).map_err(MessageError::Encode)?;

        let (payload, encoding) = match self.compression_level {
            Some(level) => (
                zstd::encode_all(packed.as_slice(), level).map_err(MessageError::Compress)?,
                Encoding::PackedZstd,
            ),
            None => (packed, Encoding::Packed),
        };

        if payload.len() > self.max_bytes {
            return Err(MessageError::TooLarge {
                size: payload.len(),
                limit: self.max_bytes,
            });
        }

        Ok(FlowMessage {
            payload,
            encoding,
            flows: flows.len(),
        })
    }
}
