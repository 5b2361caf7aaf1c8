// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

pub mod client;
pub mod hardware;
pub mod registry;
pub mod testing;

pub use client::{
    with_cancel, ComputeClient, ComputeConnector, HttpComputeClient, HttpConnector, NodeAction,
    NodeRef, NotificationFeed,
};
pub use hardware::{FixedUsage, UsageSource, UtilizationCache};
pub use registry::{ComputeInfo, ComputeRegistry};
