// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use crate::adapter::Adapter;
use crate::error::{LoomError, Result};
use crate::node_type::{ConsoleType, NodeType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type ProjectId = Uuid;
pub type NodeId = Uuid;
pub type LinkId = Uuid;
pub type ShapeId = Uuid;

pub const TOPOLOGY_REVISION: u32 = 1;
pub const TOPOLOGY_EXTENSION: &str = "loom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Closed,
    Opening,
    Opened,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Stopped,
    Started,
    Suspended,
    /// The bound compute could not be reached when the project opened.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub project_id: ProjectId,
    pub name: String,
    pub node_type: NodeType,
    pub compute_id: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub console: Option<u16>,
    pub console_type: ConsoleType,
    /// Id drawn from the compute's pool for this node type, if it needs one.
    #[serde(default)]
    pub pool_id: Option<u32>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub adapters: Vec<Adapter>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

impl Node {
    pub fn adapter(&self, number: u32) -> Result<&Adapter> {
        self.adapters
            .get(number as usize)
            .ok_or_else(|| LoomError::not_found("adapter", format!("{}/{}", self.name, number)))
    }

    pub fn adapter_mut(&mut self, number: u32) -> Result<&mut Adapter> {
        let name = self.name.clone();
        self.adapters
            .get_mut(number as usize)
            .ok_or_else(|| LoomError::not_found("adapter", format!("{}/{}", name, number)))
    }

    pub fn port_exists(&self, adapter: u32, port: u32) -> bool {
        self.adapter(adapter).map(|a| a.port_exists(port)).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub node_id: NodeId,
    pub adapter_number: u32,
    pub port_number: u32,
}

impl LinkEndpoint {
    pub fn new(node_id: NodeId, adapter_number: u32, port_number: u32) -> Self {
        Self {
            node_id,
            adapter_number,
            port_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_id: LinkId,
    pub project_id: ProjectId,
    pub nodes: [LinkEndpoint; 2],
    #[serde(default)]
    pub capturing: bool,
    #[serde(default)]
    pub capture_file_name: Option<String>,
}

impl Link {
    pub fn touches(&self, node_id: NodeId) -> bool {
        self.nodes.iter().any(|e| e.node_id == node_id)
    }

    pub fn uses(&self, endpoint: &LinkEndpoint) -> bool {
        self.nodes.iter().any(|e| e == endpoint)
    }
}

/// Free-floating SVG annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub shape_id: ShapeId,
    pub project_id: ProjectId,
    pub svg: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub z: i32,
    #[serde(default)]
    pub rotation: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub shapes: Vec<Shape>,
}

/// On-disk form of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub revision: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub auto_open: bool,
    pub topology: Topology,
}

impl TopologyDocument {
    pub fn new(project_id: ProjectId, name: impl Into<String>, topology: Topology) -> Self {
        Self {
            revision: TOPOLOGY_REVISION,
            kind: "topology".into(),
            project_id,
            name: name.into(),
            auto_open: false,
            topology,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let doc: TopologyDocument = serde_json::from_slice(bytes)?;
        if doc.kind != "topology" {
            return Err(LoomError::FormatError(format!(
                "expected a topology document, found '{}'",
                doc.kind
            )));
        }
        if doc.revision > TOPOLOGY_REVISION {
            return Err(LoomError::FormatError(format!(
                "topology revision {} is newer than supported revision {}",
                doc.revision, TOPOLOGY_REVISION
            )));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
