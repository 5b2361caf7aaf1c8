// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use crate::compute::ComputeUsage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod actions {
    pub const PING: &str = "ping";
    pub const LOG_WARNING: &str = "log.warning";
    pub const LOG_ERROR: &str = "log.error";

    pub const COMPUTE_CREATED: &str = "compute.created";
    pub const COMPUTE_UPDATED: &str = "compute.updated";
    pub const COMPUTE_DELETED: &str = "compute.deleted";

    pub const PROJECT_OPENED: &str = "project.opened";
    pub const PROJECT_CLOSED: &str = "project.closed";
    pub const PROJECT_UPDATED: &str = "project.updated";
    pub const PROJECT_DELETED: &str = "project.deleted";

    pub const NODE_CREATED: &str = "node.created";
    pub const NODE_UPDATED: &str = "node.updated";
    pub const NODE_DELETED: &str = "node.deleted";

    pub const LINK_CREATED: &str = "link.created";
    pub const LINK_UPDATED: &str = "link.updated";
    pub const LINK_DELETED: &str = "link.deleted";

    pub const SHAPE_CREATED: &str = "shape.created";
    pub const SHAPE_UPDATED: &str = "shape.updated";
    pub const SHAPE_DELETED: &str = "shape.deleted";
}

/// One message on the notification stream:
/// `{"action": .., "event": .., ...metadata}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub action: String,
    pub event: Value,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Notification {
    pub fn new(action: impl Into<String>, event: Value) -> Self {
        Self {
            action: action.into(),
            event,
            metadata: Map::new(),
        }
    }

    pub fn ping(usage: ComputeUsage) -> Self {
        Self::new(
            actions::PING,
            serde_json::json!({
                "cpu_usage_percent": usage.cpu_usage_percent,
                "memory_usage_percent": usage.memory_usage_percent,
            }),
        )
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_ping(&self) -> bool {
        self.action == actions::PING
    }

    /// The project this event concerns, from the metadata or the entity itself.
    pub fn project_id(&self) -> Option<Uuid> {
        self.metadata
            .get("project_id")
            .or_else(|| self.event.get("project_id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Where state changes are published. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_flattened() {
        let n = Notification::new(actions::NODE_CREATED, serde_json::json!({"name": "R1"}))
            .with_meta("compute_id", "c1");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["action"], "node.created");
        assert_eq!(v["event"]["name"], "R1");
        assert_eq!(v["compute_id"], "c1");
    }

    #[test]
    fn ping_carries_usage() {
        let n = Notification::ping(ComputeUsage {
            cpu_usage_percent: 12.5,
            memory_usage_percent: 40.0,
        });
        assert!(n.is_ping());
        assert_eq!(n.event["cpu_usage_percent"], 12.5);
        assert_eq!(n.event["memory_usage_percent"], 40.0);
    }

    #[test]
    fn project_scope_lookup() {
        let id = Uuid::new_v4();
        let from_event =
            Notification::new(actions::NODE_UPDATED, serde_json::json!({"project_id": id.to_string()}));
        assert_eq!(from_event.project_id(), Some(id));
        let from_meta = Notification::new(actions::LOG_WARNING, Value::Null)
            .with_meta("project_id", id.to_string());
        assert_eq!(from_meta.project_id(), Some(id));
        assert_eq!(Notification::new("x", Value::Null).project_id(), None);
    }
}
