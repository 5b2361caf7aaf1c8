// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! Talking to a compute backend.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use loom_model::{
    Capabilities, ComputeDescriptor, ComputeUsage, LoomError, Nio, Node, NodeId, NodeStatus,
    NodeType, Notification, ProjectId, Result,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const API_PREFIX: &str = "/v2/compute";

/// Events a compute pushes on its own. Ends when the compute closes the
/// stream or the client is cancelled.
pub type NotificationFeed = BoxStream<'static, Result<Notification>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Start,
    Stop,
    Suspend,
    Reload,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
            NodeAction::Suspend => "suspend",
            NodeAction::Reload => "reload",
        }
    }

    /// Status the node is in once the compute has carried the action out.
    pub fn resulting_status(&self) -> NodeStatus {
        match self {
            NodeAction::Start | NodeAction::Reload => NodeStatus::Started,
            NodeAction::Stop => NodeStatus::Stopped,
            NodeAction::Suspend => NodeStatus::Suspended,
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses a node on its compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub project_id: ProjectId,
    pub node_id: NodeId,
    pub node_type: NodeType,
}

impl From<&Node> for NodeRef {
    fn from(node: &Node) -> Self {
        Self {
            project_id: node.project_id,
            node_id: node.node_id,
            node_type: node.node_type,
        }
    }
}

impl NodeRef {
    fn path(&self) -> String {
        format!(
            "/projects/{}/{}/nodes/{}",
            self.project_id, self.node_type, self.node_id
        )
    }

    fn port_path(&self, adapter: u32, port: u32) -> String {
        format!("{}/adapters/{}/ports/{}", self.path(), adapter, port)
    }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn capabilities(&self) -> Result<Capabilities>;
    async fn usage(&self) -> Result<ComputeUsage>;
    async fn create_node(&self, node: &Node) -> Result<()>;
    async fn update_node(&self, node: &Node) -> Result<()>;
    async fn delete_node(&self, node: NodeRef) -> Result<()>;
    async fn node_action(&self, node: NodeRef, action: NodeAction) -> Result<()>;
    async fn add_nio(&self, node: NodeRef, adapter: u32, port: u32, nio: &Nio) -> Result<()>;
    async fn remove_nio(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()>;
    async fn start_capture(&self, node: NodeRef, adapter: u32, port: u32, file_name: &str) -> Result<()>;
    async fn stop_capture(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()>;
    async fn close_project(&self, project_id: ProjectId) -> Result<()>;
    async fn notifications(&self) -> Result<NotificationFeed>;
}

/// Builds clients for registered computes. Requests made through a client
/// fail with `Cancelled` once `cancel` fires.
pub trait ComputeConnector: Send + Sync {
    fn connect(
        &self,
        descriptor: &ComputeDescriptor,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ComputeClient>>;
}

/// Runs `fut` unless `token` fires first.
pub async fn with_cancel<T>(
    token: &CancellationToken,
    what: impl fmt::Display,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(LoomError::Cancelled(what.to_string())),
        r = fut => r,
    }
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    pub timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl ComputeConnector for HttpConnector {
    fn connect(
        &self,
        descriptor: &ComputeDescriptor,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn ComputeClient>> {
        Ok(Arc::new(HttpComputeClient::new(descriptor, self.timeout, cancel)?))
    }
}

pub struct HttpComputeClient {
    compute_id: String,
    base: String,
    http: reqwest::Client,
    /// No overall timeout, the feed stays open.
    feed_http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    cancel: CancellationToken,
}

impl HttpComputeClient {
    pub fn new(
        descriptor: &ComputeDescriptor,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoomError::InvalidArgument(format!("cannot build HTTP client: {}", e)))?;
        let feed_http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| LoomError::InvalidArgument(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            compute_id: descriptor.compute_id.clone(),
            base: format!("{}{}", descriptor.base_url(), API_PREFIX),
            http,
            feed_http,
            user: descriptor.user.clone(),
            password: descriptor.password.clone(),
            cancel,
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<reqwest::Response> {
        self.call_with(&self.http, method, path, body).await
    }

    async fn call_with(
        &self,
        http: &reqwest::Client,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        let mut request = http.request(method.clone(), &url);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        debug!(compute_id = %self.compute_id, %method, %url, "Compute request");
        let what = format!("{} {} on compute {}", method, path, self.compute_id);
        let response = with_cancel(&self.cancel, &what, async {
            request
                .send()
                .await
                .map_err(|e| LoomError::Unreachable(format!("{}: {}", what, e)))
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => LoomError::not_found("compute resource", path),
            StatusCode::CONFLICT => LoomError::Conflict(format!("{}: {}", what, detail)),
            StatusCode::BAD_REQUEST => LoomError::InvalidArgument(format!("{}: {}", what, detail)),
            _ => LoomError::Unreachable(format!("{} returned {}: {}", what, status, detail)),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        self.call(method, path, body).await.map(|_| ())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.call(Method::GET, path, None).await?;
        response.json::<T>().await.map_err(|e| {
            LoomError::FormatError(format!(
                "compute {} sent an unreadable {} reply: {}",
                self.compute_id, path, e
            ))
        })
    }
}

#[async_trait]
impl ComputeClient for HttpComputeClient {
    async fn capabilities(&self) -> Result<Capabilities> {
        self.get("/capabilities").await
    }

    async fn usage(&self) -> Result<ComputeUsage> {
        self.get("/statistics").await
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        let path = format!("/projects/{}/{}/nodes", node.project_id, node.node_type);
        self.send(Method::POST, &path, Some(serde_json::to_value(node)?)).await
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let path = NodeRef::from(node).path();
        self.send(Method::PUT, &path, Some(serde_json::to_value(node)?)).await
    }

    async fn delete_node(&self, node: NodeRef) -> Result<()> {
        self.send(Method::DELETE, &node.path(), None).await
    }

    async fn node_action(&self, node: NodeRef, action: NodeAction) -> Result<()> {
        let path = format!("{}/{}", node.path(), action);
        self.send(Method::POST, &path, None).await
    }

    async fn add_nio(&self, node: NodeRef, adapter: u32, port: u32, nio: &Nio) -> Result<()> {
        let path = format!("{}/nio", node.port_path(adapter, port));
        self.send(Method::POST, &path, Some(serde_json::to_value(nio)?)).await
    }

    async fn remove_nio(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()> {
        let path = format!("{}/nio", node.port_path(adapter, port));
        self.send(Method::DELETE, &path, None).await
    }

    async fn start_capture(&self, node: NodeRef, adapter: u32, port: u32, file_name: &str) -> Result<()> {
        let path = format!("{}/start_capture", node.port_path(adapter, port));
        let body = serde_json::json!({ "capture_file_name": file_name });
        self.send(Method::POST, &path, Some(body)).await
    }

    async fn stop_capture(&self, node: NodeRef, adapter: u32, port: u32) -> Result<()> {
        let path = format!("{}/stop_capture", node.port_path(adapter, port));
        self.send(Method::POST, &path, None).await
    }

    async fn close_project(&self, project_id: ProjectId) -> Result<()> {
        self.send(Method::POST, &format!("/projects/{}/close", project_id), None)
            .await
    }

    async fn notifications(&self) -> Result<NotificationFeed> {
        let response = self
            .call_with(&self.feed_http, Method::GET, "/notifications", None)
            .await?;
        let state = FeedState {
            compute_id: self.compute_id.clone(),
            body: response.bytes_stream().boxed(),
            pending: Vec::new(),
            cancel: self.cancel.clone(),
        };
        Ok(futures::stream::unfold(state, FeedState::next).boxed())
    }
}

/// Splits a streamed body into one notification per line.
struct FeedState {
    compute_id: String,
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    pending: Vec<u8>,
    cancel: CancellationToken,
}

impl FeedState {
    async fn next(mut self) -> Option<(Result<Notification>, Self)> {
        loop {
            if let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = parse_notification(&self.compute_id, &line);
                return Some((item, self));
            }
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                chunk = self.body.next() => chunk?,
            };
            match chunk {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(e) => {
                    let e = LoomError::Unreachable(format!(
                        "notification feed of compute {}: {}",
                        self.compute_id, e
                    ));
                    return Some((Err(e), self));
                }
            }
        }
    }
}

fn parse_notification(compute_id: &str, line: &[u8]) -> Result<Notification> {
    serde_json::from_slice(line).map_err(|e| {
        LoomError::FormatError(format!(
            "compute {} sent an unreadable notification: {}",
            compute_id, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_model::Protocol;
    use uuid::Uuid;

    #[test]
    fn node_paths() {
        let node = NodeRef {
            project_id: Uuid::nil(),
            node_id: Uuid::nil(),
            node_type: NodeType::Dynamips,
        };
        let nil = Uuid::nil();
        assert_eq!(
            node.port_path(1, 0),
            format!("/projects/{nil}/dynamips/nodes/{nil}/adapters/1/ports/0")
        );
    }

    #[test]
    fn actions_map_to_status() {
        assert_eq!(NodeAction::Reload.resulting_status(), NodeStatus::Started);
        assert_eq!(NodeAction::Suspend.resulting_status(), NodeStatus::Suspended);
        assert_eq!(NodeAction::Stop.to_string(), "stop");
    }

    #[test]
    fn feed_lines_parse_into_notifications() {
        let ping = parse_notification("c1", br#"{"action": "ping", "event": {"cpu_usage_percent": 1.0}}"#).unwrap();
        assert!(ping.is_ping());
        let err = parse_notification("c1", b"not json\n").unwrap_err();
        assert!(matches!(err, LoomError::FormatError(m) if m.contains("c1")));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = with_cancel(&token, "probe", std::future::pending()).await;
        assert!(matches!(result, Err(LoomError::Cancelled(_))));
    }

    #[tokio::test]
    async fn feed_splits_the_streamed_body_into_events() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n{\"action\": \"ping\", \"event\": {}}\n\n{\"action\": \"log.er")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket
                .write_all(b"ror\", \"event\": {\"message\": \"disk full\"}}\n")
                .await
                .unwrap();
        });

        let descriptor = ComputeDescriptor::new("c1", Protocol::Http, "127.0.0.1", port);
        let client =
            HttpComputeClient::new(&descriptor, Duration::from_secs(2), CancellationToken::new()).unwrap();
        let events: Vec<Result<Notification>> = client.notifications().await.unwrap().collect().await;
        let actions: Vec<String> = events.into_iter().map(|e| e.unwrap().action).collect();
        assert_eq!(actions, ["ping", "log.error"]);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let descriptor = ComputeDescriptor::new("c1", Protocol::Http, "127.0.0.1", port);
        let client =
            HttpComputeClient::new(&descriptor, Duration::from_secs(2), CancellationToken::new()).unwrap();
        assert!(matches!(client.capabilities().await, Err(LoomError::Unreachable(_))));
    }
}
