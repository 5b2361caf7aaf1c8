//! Process-wide notification fan-out.
//!
//! Every subscriber owns a bounded slot in one broadcast ring. A subscriber
//! that falls behind loses its oldest events; the producer never waits.

use loom_discovery::UsageSource;
use loom_model::{EventSink, Notification, ProjectId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

pub struct NotificationManager {
    tx: broadcast::Sender<Arc<Notification>>,
    usage: Arc<dyn UsageSource>,
    heartbeat: Duration,
}

impl NotificationManager {
    pub fn new(capacity: usize, heartbeat: Duration, usage: Arc<dyn UsageSource>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            usage,
            heartbeat,
        })
    }

    /// Pushes to every live queue without waiting on any of them.
    pub fn emit(&self, notification: Notification) {
        debug!(action = %notification.action, "Notification");
        // No receivers is the common idle case.
        let _ = self.tx.send(Arc::new(notification));
    }

    /// Serializes `entity` as the event body, tagged with its project.
    pub fn emit_entity<T: Serialize>(&self, action: &str, entity: &T, project_id: Option<ProjectId>) {
        let event = match serde_json::to_value(entity) {
            Ok(v) => v,
            Err(e) => {
                warn!(action, error = %e, "Dropping unserializable notification");
                return;
            }
        };
        let mut notification = Notification::new(action, event);
        if let Some(id) = project_id {
            notification = notification.with_meta("project_id", id.to_string());
        }
        self.emit(notification);
    }

    pub fn log_warning(&self, message: impl Into<String>, project_id: Option<ProjectId>) {
        let mut n = Notification::new(
            loom_model::actions::LOG_WARNING,
            serde_json::json!({ "message": message.into() }),
        );
        if let Some(id) = project_id {
            n = n.with_meta("project_id", id.to_string());
        }
        self.emit(n);
    }

    /// A new subscriber; dropping it unsubscribes.
    pub fn queue(&self) -> NotificationQueue {
        NotificationQueue {
            rx: self.tx.subscribe(),
            usage: self.usage.clone(),
            heartbeat: self.heartbeat,
            greeted: false,
            project: None,
            lost: 0,
        }
    }

    /// Like `queue`, but only events about `project_id` (and pings) come out.
    pub fn project_queue(&self, project_id: ProjectId) -> NotificationQueue {
        let mut queue = self.queue();
        queue.project = Some(project_id);
        queue
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }
}

impl EventSink for NotificationManager {
    fn emit(&self, notification: Notification) {
        NotificationManager::emit(self, notification)
    }
}

pub struct NotificationQueue {
    rx: broadcast::Receiver<Arc<Notification>>,
    usage: Arc<dyn UsageSource>,
    heartbeat: Duration,
    greeted: bool,
    project: Option<ProjectId>,
    lost: u64,
}

impl NotificationQueue {
    /// Next event, or a ping after `timeout` of silence. The first call always
    /// answers with a ping at once. `None` once the manager is gone.
    pub async fn get(&mut self, timeout: Duration) -> Option<Notification> {
        if !self.greeted {
            self.greeted = true;
            return Some(self.ping().await);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Some(self.ping().await),
                Ok(Ok(n)) if self.accepts(&n) => return Some((*n).clone()),
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    self.lost += skipped;
                    warn!(skipped, total = self.lost, "Notification subscriber fell behind, oldest events dropped");
                }
                Ok(Err(RecvError::Closed)) => return None,
            }
        }
    }

    /// `get` with the manager's heartbeat as timeout.
    pub async fn next(&mut self) -> Option<Notification> {
        self.get(self.heartbeat).await
    }

    /// Events lost to lag so far.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    fn accepts(&self, n: &Notification) -> bool {
        match self.project {
            None => true,
            Some(id) => n.is_ping() || n.project_id() == Some(id),
        }
    }

    async fn ping(&self) -> Notification {
        Notification::ping(self.usage.usage().await)
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        if self.lost > 0 {
            debug!(lost = self.lost, "Notification subscriber closed");
        }
    }
}

/// One line of the newline-delimited stream.
pub fn to_line(n: &Notification) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(n)?;
    line.push('\n');
    Ok(line)
}

/// Undoes `to_line`.
pub fn from_line(line: &str) -> serde_json::Result<Notification> {
    serde_json::from_str(line.trim_end())
}
