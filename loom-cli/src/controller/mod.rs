//! The controller context: everything a running controller shares, built once
//! at start and handed to each project.

pub mod persist;
pub mod pool;
pub mod project;

pub use pool::{ComputePools, IdPool};
pub use project::{NewNode, NewShape, NodeUpdate, Project, ProjectInfo, ShapeUpdate};

use crate::config::ControllerConfig;
use crate::notification::NotificationManager;
use loom_discovery::{ComputeConnector, ComputeInfo, ComputeRegistry, UsageSource, UtilizationCache};
use loom_model::{
    actions, ComputeDescriptor, LoomError, Notification, ProjectId, ProjectStatus,
    Result, TopologyDocument, TOPOLOGY_EXTENSION,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared by the controller and its projects.
pub struct Services {
    pub config: ControllerConfig,
    pub registry: Arc<ComputeRegistry>,
    pub notifications: Arc<NotificationManager>,
    pub pools: ComputePools,
}

pub struct Controller {
    services: Arc<Services>,
    projects: RwLock<BTreeMap<ProjectId, Arc<Project>>>,
    refresh: StdMutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(config: ControllerConfig, connector: Arc<dyn ComputeConnector>) -> Arc<Self> {
        let usage = Arc::new(UtilizationCache::new(config.controller.usage_sample_interval));
        Self::with_usage(config, connector, usage)
    }

    pub fn with_usage(
        config: ControllerConfig,
        connector: Arc<dyn ComputeConnector>,
        usage: Arc<dyn UsageSource>,
    ) -> Arc<Self> {
        let notifications = NotificationManager::new(
            config.controller.notification_capacity,
            config.controller.heartbeat,
            usage,
        );
        let registry = ComputeRegistry::new(connector, notifications.clone());
        let pools = ComputePools::new(config.pools.clone());
        Arc::new(Self {
            services: Arc::new(Services {
                config,
                registry,
                notifications,
                pools,
            }),
            projects: RwLock::new(BTreeMap::new()),
            refresh: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.services.config
    }

    pub fn registry(&self) -> &Arc<ComputeRegistry> {
        &self.services.registry
    }

    pub fn notifications(&self) -> &Arc<NotificationManager> {
        &self.services.notifications
    }

    pub fn pools(&self) -> &ComputePools {
        &self.services.pools
    }

    /// Registers the configured computes and starts the periodic refresh.
    pub async fn start(&self) {
        for descriptor in self.services.config.computes.clone() {
            let id = descriptor.compute_id.clone();
            if let Err(e) = self.add_compute(descriptor).await {
                warn!(compute_id = %id, error = %e, "Configured compute not registered");
            }
        }
        let handle = self
            .services
            .registry
            .spawn_refresh(self.services.config.controller.compute_refresh);
        if let Some(old) = self.refresh_slot().replace(handle) {
            old.abort();
        }
    }

    // ---- computes ---------------------------------------------------------

    pub async fn add_compute(&self, descriptor: ComputeDescriptor) -> Result<ComputeInfo> {
        self.services.registry.register(descriptor).await
    }

    /// Refused while any node of an open project is bound to the compute.
    pub async fn remove_compute(&self, compute_id: &str) -> Result<()> {
        self.services.registry.deregister(compute_id).await
    }

    /// Folds an event pushed by a compute into the controller stream. Every
    /// registered compute's own feed is followed in the background and lands
    /// here too.
    pub async fn handle_compute_notification(&self, compute_id: &str, notification: Notification) -> Result<()> {
        self.services
            .registry
            .handle_notification(compute_id, notification)
            .await
    }

    // ---- projects ---------------------------------------------------------

    /// A new empty project in its own directory under `projects_dir`, opened
    /// and written once.
    pub async fn create_project(&self, name: &str) -> Result<Arc<Project>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LoomError::InvalidArgument("project name is empty".into()));
        }
        let id = Uuid::new_v4();
        let file = self
            .services
            .config
            .controller
            .projects_dir
            .join(id.to_string())
            .join(format!("{}.{}", project::sanitize_file_name(name), TOPOLOGY_EXTENSION));

        let project = Project::new(id, name, file, false, self.services.clone());
        {
            let mut projects = self.projects.write().await;
            if projects.values().any(|p| p.name() == name) {
                return Err(LoomError::conflict(format!("a project named {} already exists", name)));
            }
            projects.insert(id, project.clone());
        }

        let opened = async {
            project.open().await?;
            project.flush().await
        }
        .await;
        if let Err(e) = opened {
            self.projects.write().await.remove(&id);
            return Err(e);
        }
        info!(project_id = %id, name, "Project created");
        Ok(project)
    }

    /// Makes a saved topology known without opening it.
    pub async fn register_project(&self, path: &Path) -> Result<Arc<Project>> {
        let bytes = tokio::fs::read(path).await?;
        let doc = TopologyDocument::from_json(&bytes)?;

        let mut projects = self.projects.write().await;
        if let Some(existing) = projects.get(&doc.project_id) {
            return Err(LoomError::conflict(format!(
                "project {} is already loaded from {}",
                doc.project_id,
                existing.file().display()
            )));
        }
        let project = Project::new(
            doc.project_id,
            doc.name,
            path.to_path_buf(),
            doc.auto_open,
            self.services.clone(),
        );
        projects.insert(doc.project_id, project.clone());
        debug!(project_id = %doc.project_id, path = %path.display(), "Project registered");
        Ok(project)
    }

    /// Registers `path` and opens it.
    pub async fn load_project(&self, path: &Path) -> Result<Arc<Project>> {
        let project = self.register_project(path).await?;
        project.open().await?;
        Ok(project)
    }

    /// Registers every `<projects_dir>/*/*.loom` and opens those marked
    /// `auto_open`. Unreadable files are skipped.
    pub async fn load_projects_dir(&self) -> usize {
        let dir = self.services.config.controller.projects_dir.clone();
        let files = match find_topologies(&dir).await {
            Ok(f) => f,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No projects directory");
                return 0;
            }
        };

        let mut loaded = 0;
        for file in files {
            match self.register_project(&file).await {
                Ok(project) => {
                    loaded += 1;
                    if project.document().await.auto_open {
                        if let Err(e) = project.open().await {
                            warn!(project_id = %project.id(), error = %e, "Auto-open failed");
                        }
                    }
                }
                Err(e) => warn!(path = %file.display(), error = %e, "Skipping project"),
            }
        }
        info!(loaded, dir = %dir.display(), "Projects loaded");
        loaded
    }

    pub async fn project(&self, project_id: ProjectId) -> Result<Arc<Project>> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or_else(|| LoomError::not_found("project", project_id))
    }

    pub async fn open_project(&self, project_id: ProjectId) -> Result<Arc<Project>> {
        let project = self.project(project_id).await?;
        project.open().await?;
        Ok(project)
    }

    pub async fn close_project(&self, project_id: ProjectId) -> Result<()> {
        self.project(project_id).await?.close().await
    }

    /// Closes the project and removes it from disk. Only a directory under
    /// `projects_dir` is removed whole; elsewhere just the topology file goes.
    pub async fn delete_project(&self, project_id: ProjectId) -> Result<()> {
        let project = self.project(project_id).await?;
        project.close().await?;

        let projects_dir = &self.services.config.controller.projects_dir;
        if project.dir().starts_with(projects_dir) && project.dir() != projects_dir.as_path() {
            remove_if_present(tokio::fs::remove_dir_all(project.dir()).await)?;
        } else {
            remove_if_present(tokio::fs::remove_file(project.file()).await)?;
        }

        self.projects.write().await.remove(&project_id);
        info!(project_id = %project_id, "Project deleted");
        self.services.notifications.emit_entity(
            actions::PROJECT_DELETED,
            &project.info().await,
            Some(project_id),
        );
        Ok(())
    }

    /// Sorted by name.
    pub async fn list_projects(&self) -> Vec<ProjectInfo> {
        let projects: Vec<Arc<Project>> = self.projects.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(projects.len());
        for project in projects {
            infos.push(project.info().await);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Closes open projects, then stops probing computes.
    pub async fn shutdown(&self) {
        let projects: Vec<Arc<Project>> = self.projects.read().await.values().cloned().collect();
        for project in projects {
            if project.status() == ProjectStatus::Opened {
                if let Err(e) = project.close().await {
                    warn!(project_id = %project.id(), error = %e, "Close on shutdown failed");
                }
            }
        }
        if let Some(handle) = self.refresh_slot().take() {
            handle.abort();
        }
        self.services.registry.shutdown().await;
        info!("Controller stopped");
    }

    fn refresh_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn find_topologies(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let mut inner = tokio::fs::read_dir(entry.path()).await?;
        while let Some(file) = inner.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TOPOLOGY_EXTENSION) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn remove_if_present(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
