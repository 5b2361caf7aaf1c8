// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! In-memory compute backends for tests and offline runs.

use crate::client::{with_cancel, ComputeClient, ComputeConnector, NodeAction, NodeRef, NotificationFeed};
use async_trait::async_trait;
use futures::StreamExt;
use loom_model::{
    Capabilities, ComputeDescriptor, ComputeUsage, EventSink, LoomError, Nio, Node, NodeType,
    Notification, ProjectId, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// A compute that answers from memory and records every call.
pub struct FakeCompute {
    capabilities: Mutex<Capabilities>,
    reachable: AtomicBool,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
    cancel: Mutex<CancellationToken>,
    feed: broadcast::Sender<Notification>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new(&NodeType::ALL)
    }
}

impl FakeCompute {
    pub fn new(node_types: &[NodeType]) -> Self {
        Self {
            capabilities: Mutex::new(Capabilities {
                version: "2.2.0".into(),
                platform: "linux".into(),
                node_types: node_types.iter().map(|t| t.as_str().to_string()).collect(),
                limits: Default::default(),
            }),
            reachable: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            feed: broadcast::channel(64).0,
        }
    }

    pub fn unreachable(node_types: &[NodeType]) -> Self {
        let fake = Self::new(node_types);
        fake.set_reachable(false);
        fake
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every call waits this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *guard(&self.delay) = delay;
    }

    /// e.g. `["create_node R1", "add_nio R1 0/0"]`.
    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        guard(&self.calls).iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Sends `notification` to everyone following this compute's feed.
    pub fn push(&self, notification: Notification) {
        let _ = self.feed.send(notification);
    }

    /// Open notification feeds.
    pub fn followers(&self) -> usize {
        self.feed.receiver_count()
    }

    async fn answer(&self, call: String) -> Result<()> {
        let delay = *guard(&self.delay);
        let cancel = guard(&self.cancel).clone();
        with_cancel(&cancel, call.clone(), async {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(LoomError::Unreachable(format!("{}: connection refused", call)));
            }
            guard(&self.calls).push(call);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ComputeClient for FakeCompute {
    async fn capabilities(&self) -> Result<Capabilities> {
        self.answer("capabilities".into()).await?;
        Ok(guard(&self.capabilities).clone())
    }

    async fn usage(&self) -> Result<ComputeUsage> {
        self.answer("usage".into()).await?;
        Ok(ComputeUsage {
            cpu_usage_percent: 10.0,
            memory_usage_percent: 20.0,
        })
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        self.answer(format!("create_node {}", node.name)).await
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        self.answer(format!("update_node {}", node.name)).await
    }

    async fn delete_node(&self, node: NodeRef) -> Result<()> {
        self.answer(format!("delete_node {}", node.node_id)).await
    }

    async fn node_action(&self, node: NodeRef, action: NodeAction) -> Result<()> {
        self.answer(format!("{} {}", action, node.node_id)).await
    }

    async fn add_nio(&self, node: NodeRef, adapter: u32, port: u32, _nio: &Nio) -> Result<()> {
        self.answer(format!("add_nio {} {}/{}", node.node_id, adapter, port)).await
    }

    async fn remove_nio(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()> {
        self.answer(format!("remove_nio {} {}/{}", node.node_id, adapter, port)).await
    }

    async fn start_capture(&self, node: NodeRef, adapter: u32, port: u32, file_name: &str) -> Result<()> {
        self.answer(format!("start_capture {} {}/{} {}", node.node_id, adapter, port, file_name))
            .await
    }

    async fn stop_capture(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()> {
        self.answer(format!("stop_capture {} {}/{}", node.node_id, adapter, port)).await
    }

    async fn close_project(&self, project_id: ProjectId) -> Result<()> {
        self.answer(format!("close_project {}", project_id)).await
    }

    async fn notifications(&self) -> Result<NotificationFeed> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LoomError::Unreachable("notifications: connection refused".into()));
        }
        let state = (self.feed.subscribe(), guard(&self.cancel).clone());
        let feed = futures::stream::unfold(state, |(mut rx, cancel)| async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    r = rx.recv() => r,
                };
                match received {
                    Ok(n) => return Some((Ok(n), (rx, cancel))),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(feed.boxed())
    }
}

/// Hands out pre-registered fakes by compute id; unknown ids get a fresh,
/// reachable fake that supports every node type.
#[derive(Default)]
pub struct FakeConnector {
    computes: Mutex<HashMap<String, Arc<FakeCompute>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, compute_id: &str, fake: FakeCompute) -> Arc<FakeCompute> {
        let fake = Arc::new(fake);
        guard(&self.computes).insert(compute_id.to_string(), fake.clone());
        fake
    }

    pub fn get(&self, compute_id: &str) -> Option<Arc<FakeCompute>> {
        guard(&self.computes).get(compute_id).cloned()
    }
}

impl ComputeConnector for FakeConnector {
    fn connect(
        &self,
        descriptor: &ComputeDescriptor,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ComputeClient>> {
        let fake = guard(&self.computes)
            .entry(descriptor.compute_id.clone())
            .or_insert_with(|| Arc::new(FakeCompute::default()))
            .clone();
        *guard(&fake.cancel) = cancel;
        Ok(fake)
    }
}

/// Keeps every notification it is handed.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn actions(&self) -> Vec<String> {
        guard(&self.seen).iter().map(|n| n.action.clone()).collect()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *guard(&self.seen))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, notification: Notification) {
        guard(&self.seen).push(notification);
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
