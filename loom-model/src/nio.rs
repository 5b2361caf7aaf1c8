// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Endpoint description of a virtual wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NioKind {
    Udp {
        lport: u16,
        rhost: String,
        rport: u16,
    },
    Tap {
        tap_device: String,
    },
    Unix {
        local_file: PathBuf,
        remote_file: PathBuf,
    },
    Null,
    Ethernet {
        ethernet_device: String,
    },
    LinuxEthernet {
        ethernet_device: String,
    },
}

/// A NIO bound to one adapter port, plus its packet-capture state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nio {
    #[serde(flatten)]
    pub kind: NioKind,
    #[serde(default)]
    pub capturing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_file: Option<PathBuf>,
}

impl Nio {
    pub fn new(kind: NioKind) -> Self {
        Self {
            kind,
            capturing: false,
            capture_file: None,
        }
    }

    pub fn udp(lport: u16, rhost: impl Into<String>, rport: u16) -> Self {
        Self::new(NioKind::Udp {
            lport,
            rhost: rhost.into(),
            rport,
        })
    }

    pub fn start_capture(&mut self, file: PathBuf) {
        self.capturing = true;
        self.capture_file = Some(file);
    }

    pub fn stop_capture(&mut self) {
        self.capturing = false;
        self.capture_file = None;
    }

    /// Local UDP port held by this NIO, if it is a tunnel.
    pub fn udp_port(&self) -> Option<u16> {
        match self.kind {
            NioKind::Udp { lport, .. } => Some(lport),
            _ => None,
        }
    }
}
