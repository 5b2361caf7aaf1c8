// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use crate::error::{LoomError, Result};
use crate::node_type::NodeType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// How to reach a compute backend. Read from configuration or registration
/// requests.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDescriptor {
    pub compute_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

// Keeps the password out of logs.
impl fmt::Debug for ComputeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeDescriptor")
            .field("compute_id", &self.compute_id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish()
    }
}

impl ComputeDescriptor {
    pub fn new(compute_id: impl Into<String>, protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            compute_id: compute_id.into(),
            name: None,
            protocol,
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compute_id.trim().is_empty() {
            return Err(LoomError::InvalidArgument("compute id is empty".into()));
        }
        let host = self.host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
            return Err(LoomError::InvalidArgument(format!(
                "invalid compute host '{}'",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(LoomError::InvalidArgument("compute port must be non-zero".into()));
        }
        if self.password.is_some() && self.user.is_none() {
            return Err(LoomError::InvalidArgument(
                "a compute password requires a user".into(),
            ));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.compute_id)
    }

    pub fn base_url(&self) -> String {
        // IPv6 literals need brackets inside a URL.
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

/// What `GET /capabilities` answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub node_types: Vec<String>,
    /// Upper bounds the backend declares for its id pools, if any.
    #[serde(default)]
    pub limits: std::collections::BTreeMap<String, u32>,
}

impl Capabilities {
    pub fn supports(&self, node_type: NodeType) -> bool {
        self.node_types.iter().any(|t| t == node_type.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ComputeUsage {
    pub cpu_usage_percent: f32,
    pub memory_usage_percent: f32,
}
