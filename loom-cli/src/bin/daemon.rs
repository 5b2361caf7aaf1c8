use anyhow::{Context, Result};
use clap::Parser;
use loom_cli::config::ControllerConfig;
use loom_cli::logging::init_logging;
use loom_cli::notification::to_line;
use loom_cli::Controller;
use loom_discovery::HttpConnector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "loom-daemon")]
struct DaemonCli {
    /// Controller config (defaults to ~/.loom/loom.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides controller.projects_dir
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    /// Serve the notification stream as JSON lines on this address
    #[arg(long)]
    notify_listen: Option<SocketAddr>,

    /// Timeout for each compute API call
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    compute_timeout: std::time::Duration,

    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonCli::parse();
    init_logging("loom-daemon", args.json_logs);

    let config_path = args.config.clone().unwrap_or_else(ControllerConfig::default_path);
    let mut config = ControllerConfig::load(&config_path)?;
    if let Some(dir) = args.projects_dir {
        config.controller.projects_dir = dir;
    }
    tokio::fs::create_dir_all(&config.controller.projects_dir)
        .await
        .with_context(|| format!("creating {}", config.controller.projects_dir.display()))?;

    let connector = Arc::new(HttpConnector {
        timeout: args.compute_timeout,
    });
    let controller = Controller::new(config, connector);
    controller.start().await;
    controller.load_projects_dir().await;

    // 1. Shutdown channel shared by every task
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = JoinSet::new();

    // 2. Notification stream
    if let Some(addr) = args.notify_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!(addr = %listener.local_addr()?, "Serving notifications");
        tasks.spawn(serve_notifications(listener, controller.clone(), shutdown_tx.clone()));
    }

    // 3. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    controller.shutdown().await;
    Ok(())
}

async fn serve_notifications(
    listener: TcpListener,
    controller: Arc<Controller>,
    shutdown: broadcast::Sender<()>,
) {
    let mut stop = shutdown.subscribe();
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Notification subscriber connected");
                    sessions.spawn(stream_to(stream, controller.clone(), shutdown.subscribe()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    while sessions.join_next().await.is_some() {}
}

/// One private queue per connection, dropped when the peer goes away.
async fn stream_to(mut stream: TcpStream, controller: Arc<Controller>, mut stop: broadcast::Receiver<()>) {
    let mut queue = controller.notifications().queue();
    loop {
        let next = tokio::select! {
            _ = stop.recv() => break,
            n = queue.next() => n,
        };
        let Some(notification) = next else { break };
        let line = match to_line(&notification) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Unserializable notification");
                continue;
            }
        };
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            debug!(error = %e, "Notification subscriber gone");
            break;
        }
    }
    let _ = stream.shutdown().await;
}
