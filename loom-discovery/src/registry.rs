// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use crate::client::{with_cancel, ComputeClient, ComputeConnector};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use loom_model::{
    actions, Capabilities, ComputeDescriptor, ComputeUsage, EventSink, LoomError, Notification,
    Result,
};
use loom_transport::RetryPolicy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First wait before reopening a compute's notification feed.
const FEED_RECONNECT: Duration = Duration::from_secs(1);

/// Snapshot of one registered compute.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeInfo {
    #[serde(flatten)]
    pub descriptor: ComputeDescriptor,
    pub connected: bool,
    /// `None` until the first probe answers.
    pub capabilities: Option<Capabilities>,
    pub usage: Option<ComputeUsage>,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Nodes currently bound to this compute.
    pub node_count: usize,
}

impl ComputeInfo {
    fn new(descriptor: ComputeDescriptor) -> Self {
        Self {
            descriptor,
            connected: false,
            capabilities: None,
            usage: None,
            last_seen: None,
            consecutive_failures: 0,
            node_count: 0,
        }
    }

    pub fn compute_id(&self) -> &str {
        &self.descriptor.compute_id
    }
}

struct Entry {
    info: ComputeInfo,
    client: Arc<dyn ComputeClient>,
    cancel: CancellationToken,
    probe: Option<JoinHandle<()>>,
    feed: JoinHandle<()>,
}

pub struct ComputeRegistry {
    computes: RwLock<BTreeMap<String, Entry>>,
    connector: Arc<dyn ComputeConnector>,
    events: Arc<dyn EventSink>,
    probe_policy: RetryPolicy,
    failure_threshold: u32,
    shutdown: CancellationToken,
}

impl ComputeRegistry {
    pub fn new(connector: Arc<dyn ComputeConnector>, events: Arc<dyn EventSink>) -> Arc<Self> {
        Self::with_policy(connector, events, RetryPolicy::default(), 3)
    }

    pub fn with_policy(
        connector: Arc<dyn ComputeConnector>,
        events: Arc<dyn EventSink>,
        probe_policy: RetryPolicy,
        failure_threshold: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            computes: RwLock::new(BTreeMap::new()),
            connector,
            events,
            probe_policy,
            failure_threshold: failure_threshold.max(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stores the compute and starts probing it in the background. The
    /// returned record has no capabilities yet.
    pub async fn register(self: &Arc<Self>, descriptor: ComputeDescriptor) -> Result<ComputeInfo> {
        descriptor.validate()?;
        let id = descriptor.compute_id.clone();

        let mut computes = self.computes.write().await;
        if computes.contains_key(&id) {
            return Err(LoomError::conflict(format!("compute {} is already registered", id)));
        }

        let cancel = self.shutdown.child_token();
        let client = self.connector.connect(&descriptor, cancel.clone())?;
        let info = ComputeInfo::new(descriptor);
        let probe = tokio::spawn(self.clone().probe(id.clone(), client.clone(), cancel.clone()));
        let feed = tokio::spawn(Self::follow(
            Arc::downgrade(self),
            id.clone(),
            client.clone(),
            cancel.clone(),
        ));
        computes.insert(
            id.clone(),
            Entry {
                info: info.clone(),
                client,
                cancel,
                probe: Some(probe),
                feed,
            },
        );
        drop(computes);

        info!(compute_id = %id, url = %info.descriptor.base_url(), "Compute registered");
        self.emit(actions::COMPUTE_CREATED, &info);
        Ok(info)
    }

    pub async fn get(&self, id: &str) -> Result<ComputeInfo> {
        self.computes
            .read()
            .await
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| LoomError::not_found("compute", id))
    }

    /// Sorted by compute id.
    pub async fn list(&self) -> Vec<ComputeInfo> {
        self.computes
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn client(&self, id: &str) -> Result<Arc<dyn ComputeClient>> {
        self.computes
            .read()
            .await
            .get(id)
            .map(|e| e.client.clone())
            .ok_or_else(|| LoomError::not_found("compute", id))
    }

    /// Fires when the compute is deregistered.
    pub async fn cancel_token(&self, id: &str) -> Result<CancellationToken> {
        self.computes
            .read()
            .await
            .get(id)
            .map(|e| e.cancel.clone())
            .ok_or_else(|| LoomError::not_found("compute", id))
    }

    /// Refuses while nodes are still bound. Aborts the probe and cancels any
    /// request in flight to the compute.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let entry = {
            let mut computes = self.computes.write().await;
            let entry = computes
                .get(id)
                .ok_or_else(|| LoomError::not_found("compute", id))?;
            if entry.info.node_count > 0 {
                return Err(LoomError::conflict(format!(
                    "compute {} still has {} active node(s)",
                    id, entry.info.node_count
                )));
            }
            computes.remove(id)
        };

        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Some(probe) = entry.probe {
                probe.abort();
            }
            entry.feed.abort();
            info!(compute_id = %id, "Compute deregistered");
            self.emit(actions::COMPUTE_DELETED, &entry.info);
        }
        Ok(())
    }

    /// Counts a node against the compute and hands out its client.
    pub async fn bind_node(&self, id: &str) -> Result<Arc<dyn ComputeClient>> {
        let mut computes = self.computes.write().await;
        let entry = computes
            .get_mut(id)
            .ok_or_else(|| LoomError::not_found("compute", id))?;
        entry.info.node_count += 1;
        Ok(entry.client.clone())
    }

    pub async fn unbind_node(&self, id: &str) {
        if let Some(entry) = self.computes.write().await.get_mut(id) {
            entry.info.node_count = entry.info.node_count.saturating_sub(1);
        }
    }

    /// Capabilities as last probed, probing once now if none are known.
    pub async fn ensure_capabilities(&self, id: &str) -> Result<Capabilities> {
        let (known, client, cancel) = {
            let computes = self.computes.read().await;
            let entry = computes
                .get(id)
                .ok_or_else(|| LoomError::not_found("compute", id))?;
            (entry.info.capabilities.clone(), entry.client.clone(), entry.cancel.clone())
        };
        if let Some(caps) = known {
            return Ok(caps);
        }

        let result = with_cancel(&cancel, format!("probe of compute {}", id), client.capabilities()).await;
        self.record_probe(id, &result).await;
        result.map_err(|e| match e {
            LoomError::Cancelled(_) => e,
            other => LoomError::Unreachable(format!("compute {}: {}", id, other)),
        })
    }

    pub async fn update_usage(&self, id: &str, cpu_usage_percent: f32, memory_usage_percent: f32) -> Result<()> {
        let info = {
            let mut computes = self.computes.write().await;
            let entry = computes
                .get_mut(id)
                .ok_or_else(|| LoomError::not_found("compute", id))?;
            entry.info.usage = Some(ComputeUsage {
                cpu_usage_percent,
                memory_usage_percent,
            });
            entry.info.last_seen = Some(Utc::now());
            entry.info.clone()
        };
        self.emit(actions::COMPUTE_UPDATED, &info);
        Ok(())
    }

    /// Folds an event pushed by compute `id` into the event stream. Pings
    /// update its usage, anything else is forwarded tagged with the compute.
    pub async fn handle_notification(&self, id: &str, notification: Notification) -> Result<()> {
        if notification.is_ping() {
            let usage: ComputeUsage = serde_json::from_value(notification.event)?;
            return self
                .update_usage(id, usage.cpu_usage_percent, usage.memory_usage_percent)
                .await;
        }
        if !self.computes.read().await.contains_key(id) {
            return Err(LoomError::not_found("compute", id));
        }
        self.events.emit(notification.with_meta("compute_id", id));
        Ok(())
    }

    /// Re-probes every compute once.
    pub async fn refresh(&self) {
        let targets: Vec<(String, Arc<dyn ComputeClient>, CancellationToken)> = self
            .computes
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.client.clone(), e.cancel.clone()))
            .collect();

        let probes = targets.into_iter().map(|(id, client, cancel)| async move {
            let caps = with_cancel(&cancel, &id, client.capabilities()).await;
            if matches!(caps, Err(LoomError::Cancelled(_))) {
                return;
            }
            self.record_probe(&id, &caps).await;
            if caps.is_ok() {
                if let Ok(Ok(usage)) = tokio::time::timeout(Duration::from_secs(5), client.usage()).await {
                    let _ = self
                        .update_usage(&id, usage.cpu_usage_percent, usage.memory_usage_percent)
                        .await;
                }
            }
        });
        futures::future::join_all(probes).await;
    }

    /// Periodic `refresh` until `shutdown` is called.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let stop = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => registry.refresh().await,
                }
            }
            debug!("Compute refresh stopped");
        })
    }

    /// Cancels every probe, feed and in-flight request.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.computes.read().await.values() {
            if let Some(probe) = &entry.probe {
                probe.abort();
            }
            entry.feed.abort();
        }
    }

    /// Follows the compute's notification feed until `cancel` fires,
    /// reopening it after transient failures. Stops for good when the
    /// compute has no feed to offer.
    async fn follow(
        registry: Weak<Self>,
        id: String,
        client: Arc<dyn ComputeClient>,
        cancel: CancellationToken,
    ) {
        let mut backoff = RetryPolicy::reconnect(FEED_RECONNECT).backoff();
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                r = client.notifications() => r,
            };
            match opened {
                Ok(mut feed) => {
                    debug!(compute_id = %id, "Following compute notifications");
                    backoff.reset();
                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return,
                            item = feed.next() => item,
                        };
                        let notification = match item {
                            Some(Ok(n)) => n,
                            Some(Err(e)) if e.is_transient() => {
                                warn!(compute_id = %id, error = %e, "Compute notification feed broke");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!(compute_id = %id, error = %e, "Skipping compute notification");
                                continue;
                            }
                            None => break,
                        };
                        let Some(registry) = registry.upgrade() else {
                            return;
                        };
                        if let Err(e) = registry.handle_notification(&id, notification).await {
                            warn!(compute_id = %id, error = %e, "Dropping compute notification");
                        }
                    }
                }
                Err(e) if !e.is_transient() => {
                    info!(compute_id = %id, error = %e, "Compute offers no notification feed");
                    return;
                }
                Err(e) => debug!(compute_id = %id, error = %e, "Compute notification feed unavailable"),
            }
            let Some(delay) = backoff.next_delay() else {
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn probe(self: Arc<Self>, id: String, client: Arc<dyn ComputeClient>, cancel: CancellationToken) {
        let attempt = self.probe_policy.execute(|| client.capabilities());
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = attempt => r,
        };
        self.record_probe(&id, &result).await;
    }

    async fn record_probe(&self, id: &str, result: &Result<Capabilities>) {
        let info = {
            let mut computes = self.computes.write().await;
            let Some(entry) = computes.get_mut(id) else {
                return;
            };
            let info = &mut entry.info;
            let was_connected = info.connected;
            match result {
                Ok(caps) => {
                    let changed = !was_connected || info.capabilities.as_ref() != Some(caps);
                    info.capabilities = Some(caps.clone());
                    info.connected = true;
                    info.consecutive_failures = 0;
                    info.last_seen = Some(Utc::now());
                    if !was_connected {
                        info!(compute_id = %id, version = %caps.version, platform = %caps.platform, "Compute connected");
                    }
                    if !changed {
                        return;
                    }
                }
                Err(e) => {
                    info.consecutive_failures += 1;
                    warn!(compute_id = %id, failures = info.consecutive_failures, error = %e, "Compute probe failed");
                    if info.consecutive_failures < self.failure_threshold || !was_connected {
                        return;
                    }
                    info.connected = false;
                }
            }
            info.clone()
        };
        self.emit(actions::COMPUTE_UPDATED, &info);
    }

    fn emit(&self, action: &str, info: &ComputeInfo) {
        match serde_json::to_value(info) {
            Ok(event) => self
                .events
                .emit(Notification::new(action, event).with_meta("compute_id", info.compute_id())),
            Err(e) => warn!(compute_id = %info.compute_id(), error = %e, "Cannot serialize compute"),
        }
    }
}
