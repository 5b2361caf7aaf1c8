// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

pub mod adapter;
pub mod compute;
pub mod error;
pub mod nio;
pub mod node_type;
pub mod notification;
pub mod topology;

pub use adapter::{Adapter, AdapterKind, SubModule};
pub use compute::{Capabilities, ComputeDescriptor, ComputeUsage, Protocol};
pub use error::{LoomError, Result};
pub use nio::{Nio, NioKind};
pub use node_type::{ConsoleType, NodeTraits, NodeType, PoolKind};
pub use notification::{actions, EventSink, Notification};
pub use topology::*;

pub use serde_json;
pub use uuid;
