// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry-ingestion core for flow collection.
//!
//! Producers hand [`flow::FlowRecord`]s to an [`aggregator_service::AggregatorHandle`].
//! Records are buffered in a bounded, drop-newest [`queue::FlowQueue`] and, on a fixed
//! interval, the [`aggregator_service::AggregatorService`] run loop drains one batch,
//! compensates the surviving records' sample rates for whatever was dropped, packs them
//! into a [`message::FlowMessage`] and hands it to a single downstream consumer.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator_service;
pub mod config;
pub mod constants;
pub mod errors;
pub mod flow;
pub mod message;
pub mod metrics;
pub mod queue;
