// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use crate::adapter::{Adapter, AdapterKind};
use crate::error::LoomError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every device kind the controller knows how to place on a compute.
/// The wire names match what computes report in `node_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Vpcs,
    Qemu,
    Dynamips,
    Docker,
    Iou,
    Cloud,
    Nat,
    EthernetSwitch,
    EthernetHub,
    FrameRelaySwitch,
    AtmSwitch,
    Virtualbox,
    Vmware,
}

/// Per-compute numeric identifier pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// IOU application ids.
    ApplicationId,
    /// Dynamips router ids.
    DynamipsId,
    /// UDP tunnel ports used by link NIOs.
    UdpPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleType {
    Telnet,
    Vnc,
    None,
}

/// Static capabilities of a node kind.
#[derive(Debug, Clone, Copy)]
pub struct NodeTraits {
    pub adapter_kind: AdapterKind,
    pub adapters: u32,
    pub ports_per_adapter: u32,
    pub submodule_slots: u32,
    /// Whether `properties.adapters` may override `adapters`.
    pub variable_adapters: bool,
    pub id_pool: Option<PoolKind>,
    pub console: ConsoleType,
}

const fn traits(
    adapter_kind: AdapterKind,
    adapters: u32,
    ports_per_adapter: u32,
    submodule_slots: u32,
    variable_adapters: bool,
    id_pool: Option<PoolKind>,
    console: ConsoleType,
) -> NodeTraits {
    NodeTraits {
        adapter_kind,
        adapters,
        ports_per_adapter,
        submodule_slots,
        variable_adapters,
        id_pool,
        console,
    }
}

impl NodeType {
    pub const ALL: [NodeType; 13] = [
        NodeType::Vpcs,
        NodeType::Qemu,
        NodeType::Dynamips,
        NodeType::Docker,
        NodeType::Iou,
        NodeType::Cloud,
        NodeType::Nat,
        NodeType::EthernetSwitch,
        NodeType::EthernetHub,
        NodeType::FrameRelaySwitch,
        NodeType::AtmSwitch,
        NodeType::Virtualbox,
        NodeType::Vmware,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vpcs => "vpcs",
            NodeType::Qemu => "qemu",
            NodeType::Dynamips => "dynamips",
            NodeType::Docker => "docker",
            NodeType::Iou => "iou",
            NodeType::Cloud => "cloud",
            NodeType::Nat => "nat",
            NodeType::EthernetSwitch => "ethernet_switch",
            NodeType::EthernetHub => "ethernet_hub",
            NodeType::FrameRelaySwitch => "frame_relay_switch",
            NodeType::AtmSwitch => "atm_switch",
            NodeType::Virtualbox => "virtualbox",
            NodeType::Vmware => "vmware",
        }
    }

    /// The capability lookup table.
    pub const fn traits(&self) -> NodeTraits {
        use AdapterKind::{Ethernet, Motherboard, Serial};
        use ConsoleType::{None, Telnet, Vnc};
        match self {
            NodeType::Vpcs => traits(Ethernet, 1, 1, 0, false, Option::None, Telnet),
            NodeType::Qemu => traits(Ethernet, 1, 1, 0, true, Option::None, Telnet),
            NodeType::Dynamips => traits(
                Motherboard,
                1,
                0,
                3,
                false,
                Some(PoolKind::DynamipsId),
                Telnet,
            ),
            NodeType::Docker => traits(Ethernet, 1, 1, 0, true, Option::None, Telnet),
            NodeType::Iou => traits(
                Ethernet,
                2,
                4,
                0,
                false,
                Some(PoolKind::ApplicationId),
                Telnet,
            ),
            NodeType::Cloud => traits(Ethernet, 1, 1, 0, false, Option::None, None),
            NodeType::Nat => traits(Ethernet, 1, 1, 0, false, Option::None, None),
            NodeType::EthernetSwitch => traits(Ethernet, 1, 8, 0, false, Option::None, None),
            NodeType::EthernetHub => traits(Ethernet, 1, 8, 0, false, Option::None, None),
            NodeType::FrameRelaySwitch => traits(Serial, 1, 8, 0, false, Option::None, None),
            NodeType::AtmSwitch => traits(Serial, 1, 8, 0, false, Option::None, None),
            NodeType::Virtualbox => traits(Ethernet, 1, 1, 0, true, Option::None, Vnc),
            NodeType::Vmware => traits(Ethernet, 1, 1, 0, true, Option::None, Vnc),
        }
    }

    /// Builds the initial adapter layout. `requested` is the optional adapter
    /// count taken from the node properties.
    pub fn default_adapters(&self, requested: Option<u32>) -> Vec<Adapter> {
        let t = self.traits();
        let count = match requested {
            Some(n) if t.variable_adapters => n,
            _ => t.adapters,
        };
        (0..count)
            .map(|_| Adapter::new(t.adapter_kind, t.ports_per_adapter, t.submodule_slots))
            .collect()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| LoomError::InvalidArgument(format!("unknown node type '{}'", s)))
    }
}
