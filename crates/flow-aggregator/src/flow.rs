// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flow record data model.
//!
//! A [`FlowRecord`] is one observed traffic sample. Its `sample_rate` says how many real-world
//! flows it stands for; everything else is carried through the aggregator untouched.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Typed value of a custom column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomValue {
    Uint32(u32),
    Float32(f32),
    Str(String),
}

/// A custom key/value column attached to a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Custom {
    pub id: u32,
    pub value: CustomValue,
    #[serde(default)]
    pub is_dimension: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRecord {
    /// Observation time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub device_id: u32,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: u32,
    pub in_bytes: u64,
    pub in_pkts: u64,
    pub out_bytes: u64,
    pub out_pkts: u64,
    pub input_port: u32,
    pub output_port: u32,
    pub src_as: u32,
    pub dst_as: u32,
    pub vlan_in: u32,
    pub vlan_out: u32,
    /// How many real-world flows this record represents.
    pub sample_rate: u32,
    /// Set once the aggregator has rewritten `sample_rate`.
    pub sample_adj: bool,
    pub customs: Vec<Custom>,
}

impl Default for FlowRecord {
    fn default() -> Self {
        Self {
            timestamp: 0,
            device_id: 0,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            tcp_flags: 0,
            in_bytes: 0,
            in_pkts: 0,
            out_bytes: 0,
            out_pkts: 0,
            input_port: 0,
            output_port: 0,
            src_as: 0,
            dst_as: 0,
            vlan_in: 0,
            vlan_out: 0,
            sample_rate: 1,
            sample_adj: false,
            customs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_represents_one_flow() {
        let flow = FlowRecord::default();
        assert_eq!(flow.sample_rate, 1);
        assert!(!flow.sample_adj);
        assert!(flow.customs.is_empty());
    }

    #[test]
    fn test_parse_json_line_with_missing_fields() {
        let flow: FlowRecord = serde_json::from_str(
            r#"{"src_addr":"10.0.0.1","dst_port":443,"sample_rate":10,
                "customs":[{"id":7,"value":{"str":"edge-1"}},{"id":8,"value":{"uint32":3},"is_dimension":true}]}"#,
        )
        .expect("flow parse failed");

        assert_eq!(flow.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(flow.dst_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(flow.dst_port, 443);
        assert_eq!(flow.sample_rate, 10);
        assert_eq!(flow.customs.len(), 2);
        assert_eq!(flow.customs[0].value, CustomValue::Str("edge-1".to_string()));
        assert!(!flow.customs[0].is_dimension);
        assert!(flow.customs[1].is_dimension);
    }
}
