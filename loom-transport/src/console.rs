// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! One remote console stream shared by any number of telnet clients.
//!
//! A supervisor task owns the remote connection and reconnects forever. Remote
//! output is fanned out to every client through per-client queues. Client
//! input goes through the single remote write half, guarded by a mutex.

use crate::retry::RetryPolicy;
use crate::telnet::{TelnetOptions, TelnetParser, IAC_NOP};
use bytes::Bytes;
use loom_model::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const READ_SIZE: usize = 4096;
const CLIENT_QUEUE: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Connecting,
    Relaying,
    ShuttingDown,
    Closed,
}

impl MuxState {
    fn is_terminal(self) -> bool {
        matches!(self, MuxState::ShuttingDown | MuxState::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Label used in logs and banners, usually the node name.
    pub name: String,
    pub listen: SocketAddr,
    /// `host:port` of the device console.
    pub remote: String,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub telnet: TelnetOptions,
}

impl ConsoleConfig {
    pub fn new(name: impl Into<String>, listen: SocketAddr, remote: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen,
            remote: remote.into(),
            heartbeat: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::reconnect(Duration::from_secs(1)),
            telnet: TelnetOptions::default(),
        }
    }
}

enum Outbound {
    Data(Bytes),
    Probe(oneshot::Sender<()>),
}

struct Client {
    peer: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

struct Shared {
    config: ConsoleConfig,
    state: watch::Sender<MuxState>,
    stop: watch::Sender<bool>,
    clients: StdMutex<HashMap<u64, Client>>,
    remote_writer: Mutex<Option<OwnedWriteHalf>>,
    next_client: AtomicU64,
}

pub struct ConsoleMultiplexer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConsoleMultiplexer {
    /// Binds the listening port and starts the supervisor.
    pub async fn start(config: ConsoleConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(
            console = %config.name,
            listen = %local_addr,
            remote = %config.remote,
            "Console multiplexer started"
        );

        let shared = Shared::new(config);

        let accept = tokio::spawn(accept_loop(shared.clone(), listener));
        let supervisor = tokio::spawn(supervise(shared.clone()));

        Ok(Self {
            shared,
            local_addr,
            tasks: StdMutex::new(vec![accept, supervisor]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> MuxState {
        *self.shared.state.borrow()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Stops accepting, then closes every client and the remote connection.
    /// Safe to call more than once and from several tasks; later callers wait
    /// for the first teardown to finish.
    pub async fn shutdown(&self) {
        let first = self.shared.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = MuxState::ShuttingDown;
                true
            }
        });
        if !first {
            self.wait_closed().await;
            return;
        }
        debug!(console = %self.shared.config.name, "Console multiplexer shutting down");
        self.shared.stop.send_replace(true);

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let clients: Vec<(u64, Client)> = self.shared.clients().drain().collect();
        for (id, client) in clients {
            client.read_task.abort();
            client.write_task.abort();
            let closed = timeout(CLOSE_TIMEOUT, async {
                client.writer.lock().await.shutdown().await
            })
            .await;
            match closed {
                Ok(Ok(())) => debug!(client = id, peer = %client.peer, "Console client closed"),
                Ok(Err(e)) => warn!(client = id, error = %e, "Closing console client failed"),
                Err(_) => warn!(client = id, "Closing console client timed out"),
            }
        }

        let remote = self.shared.remote_writer.lock().await.take();
        if let Some(mut writer) = remote {
            match timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Closing remote console failed"),
                Err(_) => warn!("Closing remote console timed out"),
            }
        }

        self.shared.state.send_replace(MuxState::Closed);
        info!(console = %self.shared.config.name, "Console multiplexer closed");
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == MuxState::Closed).await;
    }
}

impl Drop for ConsoleMultiplexer {
    fn drop(&mut self) {
        if self.state() == MuxState::Closed {
            return;
        }
        self.shared.stop.send_replace(true);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for (_, client) in self.shared.clients().drain() {
            client.read_task.abort();
            client.write_task.abort();
        }
    }
}

impl Shared {
    fn new(config: ConsoleConfig) -> Arc<Self> {
        let (state, _) = watch::channel(MuxState::Idle);
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            config,
            state,
            stop,
            clients: StdMutex::new(HashMap::new()),
            remote_writer: Mutex::new(None),
            next_client: AtomicU64::new(1),
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<u64, Client>> {
        lock(&self.clients)
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Moves to `to` unless teardown has begun.
    fn transition(&self, to: MuxState) -> bool {
        let mut allowed = false;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            allowed = true;
            if *state == to {
                return false;
            }
            debug!(console = %self.config.name, from = ?*state, ?to, "Console state");
            *state = to;
            true
        });
        allowed
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.stopping() {
            return;
        }
        let _ = stream.set_nodelay(true);
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);

        let negotiation = self.config.telnet.negotiation();
        if !negotiation.is_empty() {
            let _ = tx.try_send(Outbound::Data(Bytes::from(negotiation)));
        }

        let mut clients = self.clients();
        let write_task = tokio::spawn(client_writer(self.clone(), id, writer.clone(), rx));
        let read_task = tokio::spawn(client_reader(self.clone(), id, reader, tx.clone()));
        clients.insert(
            id,
            Client {
                peer,
                tx,
                writer,
                read_task,
                write_task,
            },
        );
        info!(console = %self.config.name, client = id, %peer, "Console client attached");
    }

    fn detach(&self, id: u64, reason: &str) {
        if let Some(client) = self.clients().remove(&id) {
            client.read_task.abort();
            info!(console = %self.config.name, client = id, peer = %client.peer, reason, "Console client detached");
        }
    }

    fn broadcast(&self, data: Bytes) {
        for (id, client) in self.clients().iter() {
            match client.tx.try_send(Outbound::Data(data.clone())) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(client = *id, bytes = data.len(), "Console client is not keeping up, output dropped")
                }
            }
        }
    }

    fn banner(&self, text: &str) {
        self.broadcast(Bytes::from(format!("\r\n[loom] {}\r\n", text)));
    }

    async fn forward(&self, client: u64, data: &[u8]) {
        let mut remote = self.remote_writer.lock().await;
        let Some(writer) = remote.as_mut() else {
            debug!(client, bytes = data.len(), "Remote console not connected, input dropped");
            return;
        };
        match timeout(self.config.heartbeat, writer.write_all(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(console = %self.config.name, error = %e, "Remote console write failed");
                *remote = None;
            }
            Err(_) => {
                warn!(console = %self.config.name, "Remote console write timed out");
                *remote = None;
            }
        }
    }

    async fn probe_remote(&self) -> std::result::Result<(), String> {
        let mut remote = self.remote_writer.lock().await;
        let writer = remote
            .as_mut()
            .ok_or_else(|| "remote write side closed".to_string())?;
        match timeout(self.config.heartbeat, writer.write_all(&IAC_NOP)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("heartbeat timed out".to_string()),
        }
    }

    /// Relays remote output until the link drops. Returns why it dropped.
    async fn relay(&self, stream: TcpStream, stop: &mut watch::Receiver<bool>) -> String {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        *self.remote_writer.lock().await = Some(writer);
        self.transition(MuxState::Relaying);

        let mut buf = vec![0u8; READ_SIZE];
        let reason = loop {
            let read = tokio::select! {
                _ = stopped(stop) => break "shutting down".to_string(),
                r = timeout(self.config.heartbeat, reader.read(&mut buf)) => r,
            };
            match read {
                Ok(Ok(0)) => break "remote closed the connection".to_string(),
                Ok(Ok(n)) => self.broadcast(Bytes::copy_from_slice(&buf[..n])),
                Ok(Err(e)) => break e.to_string(),
                Err(_) => {
                    if let Err(reason) = self.probe_remote().await {
                        break reason;
                    }
                }
            }
        };

        let writer = self.remote_writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Remote console close failed");
            }
        }
        reason
    }
}

/// Resolves once `stop` reads true. The borrow guard is released before
/// returning so callers stay `Send`.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut stop = shared.stop.subscribe();
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.attach(stream, peer),
                Err(e) => {
                    warn!(console = %shared.config.name, error = %e, "Console accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!(console = %shared.config.name, "Console listener closed");
}

async fn supervise(shared: Arc<Shared>) {
    let mut stop = shared.stop.subscribe();
    let mut backoff = shared.config.reconnect.backoff();
    let remote = shared.config.remote.clone();

    loop {
        if shared.stopping() || !shared.transition(MuxState::Connecting) {
            break;
        }
        let connect = timeout(shared.config.connect_timeout, TcpStream::connect(remote.as_str()));
        let outcome = tokio::select! {
            _ = stopped(&mut stop) => break,
            r = connect => r,
        };

        let failure = match outcome {
            Ok(Ok(stream)) => {
                backoff.reset();
                info!(console = %shared.config.name, %remote, "Remote console connected");
                let reason = shared.relay(stream, &mut stop).await;
                if shared.stopping() {
                    break;
                }
                reason
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connection timed out".to_string(),
        };

        let delay = backoff
            .next_delay()
            .unwrap_or(shared.config.reconnect.max_delay);
        warn!(
            console = %shared.config.name,
            %remote,
            error = %failure,
            retry_in = ?delay,
            "Remote console unavailable"
        );
        shared.banner(&format!(
            "console {} is unavailable ({}), retrying in {:.1}s",
            remote,
            failure,
            delay.as_secs_f64()
        ));

        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = sleep(delay) => {}
        }
    }
    debug!(console = %shared.config.name, "Console supervisor stopped");
}

async fn client_writer(
    shared: Arc<Shared>,
    id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let heartbeat = shared.config.heartbeat;
    while let Some(msg) = rx.recv().await {
        let (bytes, ack) = match msg {
            Outbound::Data(bytes) => (bytes, None),
            Outbound::Probe(ack) => (Bytes::from_static(&IAC_NOP), Some(ack)),
        };
        let written = {
            let mut w = writer.lock().await;
            timeout(heartbeat, w.write_all(&bytes)).await
        };
        match written {
            Ok(Ok(())) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Ok(Err(e)) => {
                debug!(client = id, error = %e, "Console client write failed");
                break;
            }
            Err(_) => {
                debug!(client = id, "Console client write timed out");
                break;
            }
        }
    }
    shared.detach(id, "write side closed");
    if let Err(e) = writer.lock().await.shutdown().await {
        debug!(client = id, error = %e, "Console client close failed");
    }
}

async fn client_reader(
    shared: Arc<Shared>,
    id: u64,
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Outbound>,
) {
    let heartbeat = shared.config.heartbeat;
    let mut stop = shared.stop.subscribe();
    let mut parser = TelnetParser::new();
    let mut window = None;
    let mut buf = vec![0u8; READ_SIZE];

    let reason = loop {
        let read = tokio::select! {
            _ = stopped(&mut stop) => break "shutting down",
            r = timeout(heartbeat, reader.read(&mut buf)) => r,
        };
        match read {
            Ok(Ok(0)) => break "client disconnected",
            Ok(Ok(n)) => {
                let input = parser.feed(&buf[..n]);
                if parser.window() != window {
                    window = parser.window();
                    if let Some((width, height)) = window {
                        debug!(client = id, width, height, "Console client resized");
                    }
                }
                if !input.is_empty() {
                    shared.forward(id, &input).await;
                }
            }
            Ok(Err(_)) => break "read error",
            Err(_) => {
                // Idle: the probe has one more heartbeat to reach the client.
                let (ack_tx, ack_rx) = oneshot::channel();
                let probe = async {
                    tx.send(Outbound::Probe(ack_tx)).await.ok()?;
                    ack_rx.await.ok()
                };
                match timeout(heartbeat, probe).await {
                    Ok(Some(())) => continue,
                    _ => break "heartbeat timed out",
                }
            }
        }
    };
    shared.detach(id, reason);
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn background_tasks_can_be_spawned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shared = Shared::new(ConsoleConfig::new(
            "R1",
            listener.local_addr().unwrap(),
            "127.0.0.1:9",
        ));
        let accept = accept_loop(shared.clone(), listener);
        let supervisor = supervise(shared.clone());
        assert_send(&accept);
        assert_send(&supervisor);
    }

    #[tokio::test]
    async fn stop_reaches_a_waiting_loop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tx.send_replace(true);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
