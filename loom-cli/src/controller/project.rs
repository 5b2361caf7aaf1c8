//! One project: its topology, its lifecycle and every mutation on it.
//!
//! Structural mutations are serialized by `ops`; the topology lock itself is
//! only held for in-memory reads and the final commit, never across a compute
//! call. A mutation either commits completely or leaves the topology as it
//! was, and every commit emits a notification and schedules a dump.

use super::persist::{write_atomic, Persister};
use super::Services;
use loom_discovery::{with_cancel, ComputeClient, NodeAction, NodeRef};
use loom_model::{
    actions, Link, LinkEndpoint, LinkId, LoomError, Nio, Node, NodeId, NodeStatus, NodeType,
    PoolKind, ProjectId, ProjectStatus, Result, Shape, ShapeId, SubModule, Topology,
    TopologyDocument,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOOPBACK: &str = "127.0.0.1";

/// Request to create a node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub node_type: NodeType,
    pub compute_id: String,
    pub properties: Map<String, Value>,
    pub console: Option<u16>,
    pub x: i32,
    pub y: i32,
}

impl NewNode {
    pub fn new(name: impl Into<String>, node_type: NodeType, compute_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type,
            compute_id: compute_id.into(),
            properties: Map::new(),
            console: None,
            x: 0,
            y: 0,
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Partial node update. A `null` property removes the key.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub properties: Map<String, Value>,
    pub x: Option<i32>,
    pub y: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct NewShape {
    pub svg: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub rotation: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ShapeUpdate {
    pub svg: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub z: Option<i32>,
    pub rotation: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub project_id: ProjectId,
    pub name: String,
    pub status: ProjectStatus,
    pub path: PathBuf,
    pub auto_open: bool,
    pub nodes: usize,
    pub links: usize,
    pub shapes: usize,
}

pub struct Project {
    id: ProjectId,
    name: String,
    file: PathBuf,
    auto_open: bool,
    services: Arc<Services>,
    status: StdMutex<ProjectStatus>,
    topology: RwLock<Topology>,
    ops: Mutex<()>,
    cancel: StdMutex<CancellationToken>,
    persister: StdMutex<Option<Persister>>,
    /// Degraded nodes that still count against their compute.
    held: StdMutex<HashSet<NodeId>>,
}

impl Project {
    /// A closed project backed by `file`, which need not exist yet.
    pub(crate) fn new(
        id: ProjectId,
        name: impl Into<String>,
        file: PathBuf,
        auto_open: bool,
        services: Arc<Services>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            file,
            auto_open,
            services,
            status: StdMutex::new(ProjectStatus::Closed),
            topology: RwLock::new(Topology::default()),
            ops: Mutex::new(()),
            cancel: StdMutex::new(CancellationToken::new()),
            persister: StdMutex::new(None),
            held: StdMutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The directory holding the topology file and project data.
    pub fn dir(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.dir().join("project-files").join("captures")
    }

    pub fn status(&self) -> ProjectStatus {
        *guard(&self.status)
    }

    pub async fn info(&self) -> ProjectInfo {
        let topology = self.topology.read().await;
        ProjectInfo {
            project_id: self.id,
            name: self.name.clone(),
            status: self.status(),
            path: self.file.clone(),
            auto_open: self.auto_open,
            nodes: topology.nodes.len(),
            links: topology.links.len(),
            shapes: topology.shapes.len(),
        }
    }

    pub async fn document(&self) -> TopologyDocument {
        let mut doc = TopologyDocument::new(self.id, &self.name, self.topology.read().await.clone());
        doc.auto_open = self.auto_open;
        doc
    }

    /// Writes the topology now, bypassing the debounced writer.
    pub async fn flush(&self) -> Result<()> {
        let bytes = self.document().await.to_json()?;
        write_atomic(&self.file, &bytes).await?;
        debug!(project_id = %self.id, path = %self.file.display(), "Topology written");
        Ok(())
    }

    // ---- lifecycle --------------------------------------------------------

    /// Loads the saved topology and re-creates every node on its compute.
    /// A node whose compute cannot be reached is kept but marked degraded.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let _ops = self.ops.lock().await;
        {
            let mut status = guard(&self.status);
            if *status != ProjectStatus::Closed {
                return Err(LoomError::conflict(format!(
                    "project {} is {:?}, not closed",
                    self.name, *status
                )));
            }
            *status = ProjectStatus::Opening;
        }
        *guard(&self.cancel) = CancellationToken::new();
        info!(project_id = %self.id, name = %self.name, "Opening project");

        let topology = match self.read_topology().await {
            Ok(t) => t,
            Err(e) => {
                *guard(&self.status) = ProjectStatus::Closed;
                return Err(e);
            }
        };
        let (topology, rewritten) = self.bind_topology(topology).await;
        let degraded = topology
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Degraded)
            .count();
        *self.topology.write().await = topology;

        let weak = Arc::downgrade(self);
        let persister = Persister::spawn(self.services.config.controller.persist_delay, move || {
            let weak = weak.clone();
            async move {
                let Some(project) = weak.upgrade() else {
                    return false;
                };
                if let Err(e) = project.flush().await {
                    warn!(project_id = %project.id, error = %e, "Topology dump failed");
                }
                true
            }
        });
        if rewritten {
            persister.request();
        }
        *guard(&self.persister) = Some(persister);
        *guard(&self.status) = ProjectStatus::Opened;

        info!(project_id = %self.id, degraded, rewritten, "Project opened");
        let info = self.info().await;
        self.notify(actions::PROJECT_OPENED, &info);
        if rewritten {
            self.notify(actions::PROJECT_UPDATED, &info);
        }
        Ok(())
    }

    /// Aborts in-flight compute requests, saves the topology, releases every
    /// id and binding, and tells the computes to drop the project. Closing a
    /// closed project does nothing.
    pub async fn close(&self) -> Result<()> {
        {
            let mut status = guard(&self.status);
            match *status {
                ProjectStatus::Closed => return Ok(()),
                ProjectStatus::Opened => *status = ProjectStatus::Closing,
                other => {
                    return Err(LoomError::conflict(format!(
                        "project {} is {:?}",
                        self.name, other
                    )))
                }
            }
        }
        self.token().cancel();
        let _ops = self.ops.lock().await;
        info!(project_id = %self.id, "Closing project");

        let persister = guard(&self.persister).take();
        if let Some(persister) = persister {
            persister.stop().await;
        }
        if let Err(e) = self.flush().await {
            warn!(project_id = %self.id, error = %e, "Final topology dump failed");
        }

        let topology = std::mem::take(&mut *self.topology.write().await);
        let mut computes = BTreeSet::new();
        for node in topology.nodes.iter().filter(|n| n.status == NodeStatus::Degraded) {
            self.drop_hold(node).await;
        }
        for node in topology.nodes.iter().filter(|n| n.status != NodeStatus::Degraded) {
            for adapter in &node.adapters {
                for port in adapter.ports() {
                    if let Ok(Some(nio)) = adapter.nio(port) {
                        self.release_udp(&node.compute_id, nio).await;
                    }
                }
            }
            self.release_claim(node).await;
            computes.insert(node.compute_id.clone());
        }

        let registry = &self.services.registry;
        let closes = computes.iter().map(|compute_id| async move {
            let result = match registry.client(compute_id).await {
                Ok(client) => client.close_project(self.id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(project_id = %self.id, compute_id = %compute_id, error = %e, "Compute did not close project");
            }
        });
        futures::future::join_all(closes).await;

        *guard(&self.status) = ProjectStatus::Closed;
        info!(project_id = %self.id, "Project closed");
        self.notify(actions::PROJECT_CLOSED, &self.info().await);
        Ok(())
    }

    async fn read_topology(&self) -> Result<Topology> {
        let bytes = match tokio::fs::read(&self.file).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Topology::default()),
            Err(e) => return Err(e.into()),
        };
        let doc = TopologyDocument::from_json(&bytes)?;
        if doc.project_id != self.id {
            return Err(LoomError::FormatError(format!(
                "{} belongs to project {}, not {}",
                self.file.display(),
                doc.project_id,
                self.id
            )));
        }
        Ok(doc.topology)
    }

    /// Recreates saved nodes and links on their computes. The flag is set when
    /// the saved links no longer match what was bound.
    async fn bind_topology(&self, mut topology: Topology) -> (Topology, bool) {
        let mut rewritten = false;
        for node in &mut topology.nodes {
            node.project_id = self.id;
            for adapter in &mut node.adapters {
                adapter.clear_nios();
            }
            match self.create_on_compute(node).await {
                Ok(()) => node.status = NodeStatus::Stopped,
                Err(e) => {
                    node.status = NodeStatus::Degraded;
                    self.hold(node).await;
                    warn!(project_id = %self.id, node = %node.name, compute_id = %node.compute_id, error = %e, "Node degraded");
                    self.services.notifications.log_warning(
                        format!("node {} is degraded: {}", node.name, e),
                        Some(self.id),
                    );
                }
            }
        }

        let links = std::mem::take(&mut topology.links);
        for mut link in links {
            rewritten |= link.capturing;
            link.capturing = false;
            match self.rewire(&mut topology, &link).await {
                Ok(()) => topology.links.push(link),
                Err(e) if e.is_not_found() => {
                    rewritten = true;
                    warn!(project_id = %self.id, link_id = %link.link_id, error = %e, "Dropping link to a missing port");
                }
                Err(e) => {
                    warn!(project_id = %self.id, link_id = %link.link_id, error = %e, "Link left unwired");
                    topology.links.push(link);
                }
            }
        }
        (topology, rewritten)
    }

    /// Re-creates the wire of a saved link. Links touching a degraded node
    /// stay unwired.
    async fn rewire(&self, topology: &mut Topology, link: &Link) -> Result<()> {
        let [ea, eb] = link.nodes;
        let a = node_in(topology, ea.node_id)?.clone();
        let b = node_in(topology, eb.node_id)?.clone();
        check_port(&a, &ea)?;
        check_port(&b, &eb)?;
        if a.status == NodeStatus::Degraded || b.status == NodeStatus::Degraded {
            debug!(link_id = %link.link_id, "Link touches a degraded node");
            return Ok(());
        }
        let [na, nb] = self.plug([&a, &b], [ea, eb]).await?;
        bind(topology, &ea, na)?;
        bind(topology, &eb, nb)?;
        Ok(())
    }

    // ---- nodes ------------------------------------------------------------

    pub async fn nodes(&self) -> Vec<Node> {
        self.topology.read().await.nodes.clone()
    }

    pub async fn node(&self, node_id: NodeId) -> Result<Node> {
        node_in(&*self.topology.read().await, node_id).cloned()
    }

    pub async fn add_node(&self, request: NewNode) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        if request.name.trim().is_empty() {
            return Err(LoomError::InvalidArgument("node name is empty".into()));
        }
        self.check_name_free(&request.name, None).await?;

        let requested_adapters = request
            .properties
            .get("adapters")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        let mut node = Node {
            node_id: Uuid::new_v4(),
            project_id: self.id,
            name: request.name,
            node_type: request.node_type,
            compute_id: request.compute_id,
            status: NodeStatus::Stopped,
            console: request.console,
            console_type: request.node_type.traits().console,
            pool_id: None,
            properties: request.properties,
            adapters: request.node_type.default_adapters(requested_adapters),
            x: request.x,
            y: request.y,
        };
        self.create_on_compute(&mut node).await?;

        self.topology.write().await.nodes.push(node.clone());
        info!(project_id = %self.id, node = %node.name, node_type = %node.node_type, compute_id = %node.compute_id, "Node added");
        self.changed(actions::NODE_CREATED, &node);
        Ok(node)
    }

    pub async fn update_node(&self, node_id: NodeId, update: NodeUpdate) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let node = self.node(node_id).await?;
        let mut updated = node.clone();
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(LoomError::InvalidArgument("node name is empty".into()));
            }
            self.check_name_free(&name, Some(node_id)).await?;
            updated.name = name;
        }
        for (key, value) in update.properties {
            if value.is_null() {
                updated.properties.remove(&key);
            } else {
                updated.properties.insert(key, value);
            }
        }
        updated.x = update.x.unwrap_or(updated.x);
        updated.y = update.y.unwrap_or(updated.y);
        if updated == node {
            return Ok(node);
        }

        self.push_update(&updated).await?;
        self.commit_node(updated.clone()).await?;
        self.changed(actions::NODE_UPDATED, &updated);
        Ok(updated)
    }

    /// Refused while any link still touches the node.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let node = {
            let topology = self.topology.read().await;
            let node = node_in(&topology, node_id)?.clone();
            let links = topology.links.iter().filter(|l| l.touches(node_id)).count();
            if links > 0 {
                return Err(LoomError::conflict(format!(
                    "node {} still has {} link(s)",
                    node.name, links
                )));
            }
            node
        };

        if node.status != NodeStatus::Degraded {
            let client = self.services.registry.client(&node.compute_id).await?;
            self.call(
                format!("delete of node {}", node.name),
                client.delete_node(NodeRef::from(&node)),
            )
            .await?;
            self.release_claim(&node).await;
        } else {
            self.drop_hold(&node).await;
        }

        self.topology.write().await.nodes.retain(|n| n.node_id != node_id);
        info!(project_id = %self.id, node = %node.name, "Node removed");
        self.changed(actions::NODE_DELETED, &node);
        Ok(node)
    }

    pub async fn start_node(&self, node_id: NodeId) -> Result<Node> {
        self.act(node_id, NodeAction::Start).await
    }

    pub async fn stop_node(&self, node_id: NodeId) -> Result<Node> {
        self.act(node_id, NodeAction::Stop).await
    }

    pub async fn suspend_node(&self, node_id: NodeId) -> Result<Node> {
        self.act(node_id, NodeAction::Suspend).await
    }

    pub async fn reload_node(&self, node_id: NodeId) -> Result<Node> {
        self.act(node_id, NodeAction::Reload).await
    }

    /// Starts every node that is not degraded. Tries them all and returns the
    /// first failure.
    pub async fn start_all(&self) -> Result<()> {
        self.act_all(NodeAction::Start).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.act_all(NodeAction::Stop).await
    }

    async fn act(&self, node_id: NodeId, action: NodeAction) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        self.act_locked(node_id, action).await
    }

    async fn act_all(&self, action: NodeAction) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let targets: Vec<(NodeId, String)> = self
            .topology
            .read()
            .await
            .nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Degraded)
            .map(|n| (n.node_id, n.name.clone()))
            .collect();

        let mut first_error = None;
        for (node_id, name) in targets {
            if let Err(e) = self.act_locked(node_id, action).await {
                warn!(project_id = %self.id, node = %name, %action, error = %e, "Node action failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn act_locked(&self, node_id: NodeId, action: NodeAction) -> Result<Node> {
        let mut node = self.node(node_id).await?;
        ensure_live(&node)?;
        let client = self.services.registry.client(&node.compute_id).await?;
        self.call(
            format!("{} of node {}", action, node.name),
            client.node_action(NodeRef::from(&node), action),
        )
        .await?;

        node.status = action.resulting_status();
        self.commit_node(node.clone()).await?;
        debug!(project_id = %self.id, node = %node.name, %action, "Node action done");
        self.changed(actions::NODE_UPDATED, &node);
        Ok(node)
    }

    pub async fn install_submodule(
        &self,
        node_id: NodeId,
        adapter: u32,
        slot: usize,
        module: SubModule,
    ) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let mut node = self.node(node_id).await?;
        node.adapter_mut(adapter)?.install_submodule(slot, module)?;
        self.push_update(&node).await?;
        self.commit_node(node.clone()).await?;
        self.changed(actions::NODE_UPDATED, &node);
        Ok(node)
    }

    /// Refused while a port of the removed range backs a link.
    pub async fn uninstall_submodule(&self, node_id: NodeId, adapter: u32, slot: usize) -> Result<Node> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let mut node = self.node(node_id).await?;
        let card = node.adapter(adapter)?;
        if let Some(module) = card.slot(slot) {
            let range = loom_model::Adapter::slot_range(slot, module.port_count);
            let topology = self.topology.read().await;
            if let Some(link) = topology.links.iter().find(|l| {
                l.nodes.iter().any(|e| {
                    e.node_id == node_id && e.adapter_number == adapter && range.contains(&e.port_number)
                })
            }) {
                return Err(LoomError::conflict(format!(
                    "slot {} of {} backs link {}",
                    slot, node.name, link.link_id
                )));
            }
        }
        node.adapter_mut(adapter)?.uninstall_submodule(slot)?;
        self.push_update(&node).await?;
        self.commit_node(node.clone()).await?;
        self.changed(actions::NODE_UPDATED, &node);
        Ok(node)
    }

    // ---- links ------------------------------------------------------------

    pub async fn links(&self) -> Vec<Link> {
        self.topology.read().await.links.clone()
    }

    pub async fn link(&self, link_id: LinkId) -> Result<Link> {
        link_in(&*self.topology.read().await, link_id).cloned()
    }

    /// Wires two free ports with a pair of UDP tunnels pointing at each other.
    pub async fn add_link(&self, a: LinkEndpoint, b: LinkEndpoint) -> Result<Link> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        if a == b {
            return Err(LoomError::InvalidArgument(format!(
                "cannot link port {}/{} to itself",
                a.adapter_number, a.port_number
            )));
        }

        let (na, nb) = {
            let topology = self.topology.read().await;
            let na = node_in(&topology, a.node_id)?.clone();
            let nb = node_in(&topology, b.node_id)?.clone();
            for (node, end) in [(&na, &a), (&nb, &b)] {
                check_port(node, end)?;
                if node.adapter(end.adapter_number)?.nio(end.port_number)?.is_some()
                    || topology.links.iter().any(|l| l.uses(end))
                {
                    return Err(LoomError::conflict(format!(
                        "port {}/{} of {} is already connected",
                        end.adapter_number, end.port_number, node.name
                    )));
                }
                ensure_live(node)?;
            }
            (na, nb)
        };

        let [nio_a, nio_b] = self.plug([&na, &nb], [a, b]).await?;
        let link = Link {
            link_id: Uuid::new_v4(),
            project_id: self.id,
            nodes: [a, b],
            capturing: false,
            capture_file_name: None,
        };
        {
            let mut topology = self.topology.write().await;
            bind(&mut topology, &a, nio_a)?;
            bind(&mut topology, &b, nio_b)?;
            topology.links.push(link.clone());
        }
        info!(project_id = %self.id, link_id = %link.link_id, from = %na.name, to = %nb.name, "Link added");
        self.changed(actions::LINK_CREATED, &link);
        Ok(link)
    }

    /// Frees both ports for reuse. Compute-side teardown errors are logged.
    pub async fn remove_link(&self, link_id: LinkId) -> Result<Link> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let (link, ends) = {
            let topology = self.topology.read().await;
            let link = link_in(&topology, link_id)?.clone();
            let a = node_in(&topology, link.nodes[0].node_id)?.clone();
            let b = node_in(&topology, link.nodes[1].node_id)?.clone();
            (link, [a, b])
        };

        for (node, end) in ends.iter().zip(link.nodes.iter()) {
            if node.status == NodeStatus::Degraded {
                continue;
            }
            let client = match self.services.registry.client(&node.compute_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(project_id = %self.id, node = %node.name, error = %e, "No compute to unplug from");
                    continue;
                }
            };
            let node_ref = NodeRef::from(node);
            if link.capturing && end == &link.nodes[0] {
                if let Err(e) = self
                    .call(
                        "stop_capture",
                        client.stop_capture(node_ref, end.adapter_number, end.port_number),
                    )
                    .await
                {
                    warn!(project_id = %self.id, link_id = %link_id, error = %e, "Capture stop failed");
                }
            }
            if let Err(e) = self
                .call(
                    format!("unplug {}", node.name),
                    client.remove_nio(node_ref, end.adapter_number, end.port_number),
                )
                .await
            {
                warn!(project_id = %self.id, link_id = %link_id, node = %node.name, error = %e, "NIO removal failed");
            }
        }

        let freed = {
            let mut topology = self.topology.write().await;
            let mut freed = Vec::new();
            for end in &link.nodes {
                let node = node_mut(&mut topology, end.node_id)?;
                let compute_id = node.compute_id.clone();
                if let Some(nio) = node.adapter_mut(end.adapter_number)?.unbind_nio(end.port_number)? {
                    freed.push((compute_id, nio));
                }
            }
            topology.links.retain(|l| l.link_id != link_id);
            freed
        };
        for (compute_id, nio) in &freed {
            self.release_udp(compute_id, nio).await;
        }

        info!(project_id = %self.id, link_id = %link_id, "Link removed");
        self.changed(actions::LINK_DELETED, &link);
        Ok(link)
    }

    /// Captures on the first endpoint. `file_name` defaults to
    /// `<node_a>_<port_a>_to_<node_b>_<port_b>.pcap`.
    pub async fn start_capture(&self, link_id: LinkId, file_name: Option<String>) -> Result<Link> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let (mut link, a, b) = {
            let topology = self.topology.read().await;
            let link = link_in(&topology, link_id)?.clone();
            let a = node_in(&topology, link.nodes[0].node_id)?.clone();
            let b = node_in(&topology, link.nodes[1].node_id)?.clone();
            (link, a, b)
        };
        if link.capturing {
            return Err(LoomError::conflict(format!("link {} is already capturing", link_id)));
        }
        ensure_live(&a)?;
        ensure_live(&b)?;

        let [ea, eb] = link.nodes;
        let file_name = sanitize_file_name(&file_name.unwrap_or_else(|| {
            format!(
                "{}_{}-{}_to_{}_{}-{}.pcap",
                a.name, ea.adapter_number, ea.port_number, b.name, eb.adapter_number, eb.port_number
            )
        }));
        let client = self.services.registry.client(&a.compute_id).await?;
        self.call(
            format!("capture on {}", a.name),
            client.start_capture(NodeRef::from(&a), ea.adapter_number, ea.port_number, &file_name),
        )
        .await?;

        link.capturing = true;
        link.capture_file_name = Some(file_name.clone());
        {
            let mut topology = self.topology.write().await;
            let node = node_mut(&mut topology, ea.node_id)?;
            if let Some(nio) = node.adapter_mut(ea.adapter_number)?.nio_mut(ea.port_number)? {
                nio.start_capture(self.captures_dir().join(&file_name));
            }
            *link_mut(&mut topology, link_id)? = link.clone();
        }
        info!(project_id = %self.id, link_id = %link_id, file = %file_name, "Capture started");
        self.changed(actions::LINK_UPDATED, &link);
        Ok(link)
    }

    /// Stopping a link that is not capturing returns it unchanged.
    pub async fn stop_capture(&self, link_id: LinkId) -> Result<Link> {
        let _ops = self.ops.lock().await;
        self.require_opened()?;
        let (mut link, a) = {
            let topology = self.topology.read().await;
            let link = link_in(&topology, link_id)?.clone();
            let a = node_in(&topology, link.nodes[0].node_id)?.clone();
            (link, a)
        };
        if !link.capturing {
            return Ok(link);
        }

        let ea = link.nodes[0];
        let client = self.services.registry.client(&a.compute_id).await?;
        self.call(
            format!("capture stop on {}", a.name),
            client.stop_capture(NodeRef::from(&a), ea.adapter_number, ea.port_number),
        )
        .await?;

        link.capturing = false;
        {
            let mut topology = self.topology.write().await;
            let node = node_mut(&mut topology, ea.node_id)?;
            if let Some(nio) = node.adapter_mut(ea.adapter_number)?.nio_mut(ea.port_number)? {
                nio.stop_capture();
            }
            *link_mut(&mut topology, link_id)? = link.clone();
        }
        info!(project_id = %self.id, link_id = %link_id, "Capture stopped");
        self.changed(actions::LINK_UPDATED, &link);
        Ok(link)
    }

    // ---- shapes -----------------------------------------------------------

    pub async fn shapes(&self) -> Vec<Shape> {
        self.topology.read().await.shapes.clone()
    }

    pub async fn add_shape(&self, request: NewShape) -> Result<Shape> {
        self.require_opened()?;
        let shape = Shape {
            shape_id: Uuid::new_v4(),
            project_id: self.id,
            svg: request.svg,
            x: request.x,
            y: request.y,
            z: request.z,
            rotation: request.rotation,
        };
        self.topology.write().await.shapes.push(shape.clone());
        self.changed(actions::SHAPE_CREATED, &shape);
        Ok(shape)
    }

    pub async fn update_shape(&self, shape_id: ShapeId, update: ShapeUpdate) -> Result<Shape> {
        self.require_opened()?;
        let shape = {
            let mut topology = self.topology.write().await;
            let shape = topology
                .shapes
                .iter_mut()
                .find(|s| s.shape_id == shape_id)
                .ok_or_else(|| LoomError::not_found("shape", shape_id))?;
            if let Some(svg) = update.svg {
                shape.svg = svg;
            }
            shape.x = update.x.unwrap_or(shape.x);
            shape.y = update.y.unwrap_or(shape.y);
            shape.z = update.z.unwrap_or(shape.z);
            shape.rotation = update.rotation.unwrap_or(shape.rotation);
            shape.clone()
        };
        self.changed(actions::SHAPE_UPDATED, &shape);
        Ok(shape)
    }

    pub async fn remove_shape(&self, shape_id: ShapeId) -> Result<Shape> {
        self.require_opened()?;
        let shape = {
            let mut topology = self.topology.write().await;
            let index = topology
                .shapes
                .iter()
                .position(|s| s.shape_id == shape_id)
                .ok_or_else(|| LoomError::not_found("shape", shape_id))?;
            topology.shapes.remove(index)
        };
        self.changed(actions::SHAPE_DELETED, &shape);
        Ok(shape)
    }

    // ---- compute plumbing -------------------------------------------------

    /// Checks the compute supports the node, takes its pool id, binds it to
    /// the compute and creates it there. Undone completely on failure.
    async fn create_on_compute(&self, node: &mut Node) -> Result<()> {
        let registry = &self.services.registry;
        let caps = registry.ensure_capabilities(&node.compute_id).await?;
        if !caps.supports(node.node_type) {
            return Err(LoomError::conflict(format!(
                "compute {} does not support {} nodes",
                node.compute_id, node.node_type
            )));
        }
        self.services.pools.apply_limits(&node.compute_id, &caps.limits);

        if let Some(kind) = node.node_type.traits().id_pool {
            let pools = &self.services.pools;
            let id = match node.pool_id {
                Some(id) if pools.reserve(&node.compute_id, kind, id).await.is_ok() => id,
                _ => pools.allocate(&node.compute_id, kind).await?,
            };
            node.pool_id = Some(id);
        }

        let client = match registry.bind_node(&node.compute_id).await {
            Ok(c) => c,
            Err(e) => {
                self.release_pool_id(node).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .call(format!("create of node {}", node.name), client.create_node(node))
            .await
        {
            self.release_claim(node).await;
            return Err(e);
        }
        Ok(())
    }

    /// Keeps a degraded node counted against its compute, if the compute is
    /// still registered.
    async fn hold(&self, node: &Node) {
        if self.services.registry.bind_node(&node.compute_id).await.is_ok() {
            guard(&self.held).insert(node.node_id);
        }
    }

    async fn drop_hold(&self, node: &Node) {
        let held = guard(&self.held).remove(&node.node_id);
        if held {
            self.services.registry.unbind_node(&node.compute_id).await;
        }
    }

    async fn release_claim(&self, node: &Node) {
        self.release_pool_id(node).await;
        self.services.registry.unbind_node(&node.compute_id).await;
    }

    async fn release_pool_id(&self, node: &Node) {
        if let (Some(kind), Some(id)) = (node.node_type.traits().id_pool, node.pool_id) {
            self.services.pools.release(&node.compute_id, kind, id).await;
        }
    }

    async fn push_update(&self, node: &Node) -> Result<()> {
        if node.status == NodeStatus::Degraded {
            return Ok(());
        }
        let client = self.services.registry.client(&node.compute_id).await?;
        self.call(format!("update of node {}", node.name), client.update_node(node))
            .await
    }

    async fn commit_node(&self, node: Node) -> Result<()> {
        let node_id = node.node_id;
        let mut topology = self.topology.write().await;
        *node_mut(&mut topology, node_id)? = node;
        Ok(())
    }

    /// Allocates a UDP port on each side and adds the NIOs on both computes.
    async fn plug(&self, nodes: [&Node; 2], ends: [LinkEndpoint; 2]) -> Result<[Nio; 2]> {
        let [a, b] = nodes;
        let [ea, eb] = ends;
        let registry = &self.services.registry;
        let (host_a, host_b) = if a.compute_id == b.compute_id {
            (LOOPBACK.to_string(), LOOPBACK.to_string())
        } else {
            (
                registry.get(&a.compute_id).await?.descriptor.host,
                registry.get(&b.compute_id).await?.descriptor.host,
            )
        };
        let client_a = registry.client(&a.compute_id).await?;
        let client_b = registry.client(&b.compute_id).await?;

        let port_a = self.udp_port(&a.compute_id).await?;
        let port_b = match self.udp_port(&b.compute_id).await {
            Ok(p) => p,
            Err(e) => {
                self.release_port(&a.compute_id, port_a).await;
                return Err(e);
            }
        };
        let nio_a = Nio::udp(port_a, host_b, port_b);
        let nio_b = Nio::udp(port_b, host_a, port_a);

        let plugged_a = self
            .call(
                format!("plug {}", a.name),
                client_a.add_nio(NodeRef::from(a), ea.adapter_number, ea.port_number, &nio_a),
            )
            .await;
        let plugged = match plugged_a {
            Ok(()) => {
                let plugged_b = self
                    .call(
                        format!("plug {}", b.name),
                        client_b.add_nio(NodeRef::from(b), eb.adapter_number, eb.port_number, &nio_b),
                    )
                    .await;
                if plugged_b.is_err() {
                    self.unplug(&client_a, a, &ea).await;
                }
                plugged_b
            }
            Err(e) => Err(e),
        };
        if let Err(e) = plugged {
            self.release_port(&a.compute_id, port_a).await;
            self.release_port(&b.compute_id, port_b).await;
            return Err(e);
        }
        Ok([nio_a, nio_b])
    }

    async fn unplug(&self, client: &Arc<dyn ComputeClient>, node: &Node, end: &LinkEndpoint) {
        let result = client
            .remove_nio(NodeRef::from(node), end.adapter_number, end.port_number)
            .await;
        if let Err(e) = result {
            warn!(project_id = %self.id, node = %node.name, error = %e, "Rollback of NIO failed");
        }
    }

    async fn udp_port(&self, compute_id: &str) -> Result<u16> {
        let id = self.services.pools.allocate(compute_id, PoolKind::UdpPort).await?;
        u16::try_from(id).map_err(|_| LoomError::InvalidArgument(format!("UDP port {} out of range", id)))
    }

    async fn release_port(&self, compute_id: &str, port: u16) {
        self.services
            .pools
            .release(compute_id, PoolKind::UdpPort, u32::from(port))
            .await;
    }

    async fn release_udp(&self, compute_id: &str, nio: &Nio) {
        if let Some(port) = nio.udp_port() {
            self.release_port(compute_id, port).await;
        }
    }

    // ---- helpers ----------------------------------------------------------

    fn token(&self) -> CancellationToken {
        guard(&self.cancel).clone()
    }

    /// Runs a compute request that dies with the project.
    async fn call<T>(&self, what: impl fmt::Display, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let token = self.token();
        with_cancel(&token, format!("{} (project {} closing)", what, self.name), fut).await
    }

    fn require_opened(&self) -> Result<()> {
        match self.status() {
            ProjectStatus::Opened => Ok(()),
            other => Err(LoomError::conflict(format!(
                "project {} is {:?}",
                self.name, other
            ))),
        }
    }

    async fn check_name_free(&self, name: &str, except: Option<NodeId>) -> Result<()> {
        let topology = self.topology.read().await;
        if topology
            .nodes
            .iter()
            .any(|n| n.name == name && Some(n.node_id) != except)
        {
            return Err(LoomError::conflict(format!("a node named {} already exists", name)));
        }
        Ok(())
    }

    fn notify<T: Serialize>(&self, action: &str, entity: &T) {
        self.services
            .notifications
            .emit_entity(action, entity, Some(self.id));
    }

    /// Notify and schedule a dump.
    fn changed<T: Serialize>(&self, action: &str, entity: &T) {
        self.notify(action, entity);
        if let Some(persister) = guard(&self.persister).as_ref() {
            persister.request();
        }
    }
}

fn node_in(topology: &Topology, node_id: NodeId) -> Result<&Node> {
    topology
        .nodes
        .iter()
        .find(|n| n.node_id == node_id)
        .ok_or_else(|| LoomError::not_found("node", node_id))
}

fn node_mut(topology: &mut Topology, node_id: NodeId) -> Result<&mut Node> {
    topology
        .nodes
        .iter_mut()
        .find(|n| n.node_id == node_id)
        .ok_or_else(|| LoomError::not_found("node", node_id))
}

fn link_in(topology: &Topology, link_id: LinkId) -> Result<&Link> {
    topology
        .links
        .iter()
        .find(|l| l.link_id == link_id)
        .ok_or_else(|| LoomError::not_found("link", link_id))
}

fn link_mut(topology: &mut Topology, link_id: LinkId) -> Result<&mut Link> {
    topology
        .links
        .iter_mut()
        .find(|l| l.link_id == link_id)
        .ok_or_else(|| LoomError::not_found("link", link_id))
}

fn bind(topology: &mut Topology, end: &LinkEndpoint, nio: Nio) -> Result<()> {
    node_mut(topology, end.node_id)?
        .adapter_mut(end.adapter_number)?
        .bind_nio(end.port_number, nio)
}

fn check_port(node: &Node, end: &LinkEndpoint) -> Result<()> {
    if node.port_exists(end.adapter_number, end.port_number) {
        Ok(())
    } else {
        Err(LoomError::not_found(
            "port",
            format!("{} {}/{}", node.name, end.adapter_number, end.port_number),
        ))
    }
}

fn ensure_live(node: &Node) -> Result<()> {
    if node.status == NodeStatus::Degraded {
        return Err(LoomError::Unreachable(format!(
            "node {} is degraded, compute {} was unreachable",
            node.name, node.compute_id
        )));
    }
    Ok(())
}

/// Keeps `[A-Za-z0-9._-]`, everything else becomes `-`.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "capture.pcap".to_string()
    } else {
        cleaned.to_string()
    }
}

fn guard<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
