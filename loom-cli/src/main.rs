use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loom_cli::config::ControllerConfig;
use loom_cli::log_operation;
use loom_cli::logging::init_logging;
use loom_codec::{pack_dir, resolve_chain, unpack_dir, CodecRegistry, Qcow2Image};
use loom_discovery::{ComputeClient, HttpComputeClient};
use loom_model::{ComputeDescriptor, Protocol, TopologyDocument, TOPOLOGY_EXTENSION};
use loom_transport::{ConsoleConfig, ConsoleMultiplexer, RetryPolicy, TelnetOptions};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Network-emulation controller tools")]
struct Cli {
    /// Controller config (defaults to ~/.loom/loom.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or rebase qcow2 disk images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
    /// Share one remote telnet console between many local clients
    Console {
        /// Local address clients connect to
        #[arg(long)]
        listen: SocketAddr,
        /// host:port of the device console
        #[arg(long)]
        remote: String,
        #[arg(long, default_value = "console")]
        name: String,
        /// Do not send telnet option negotiation to new clients
        #[arg(long)]
        raw: bool,
    },
    /// Ask a compute what it can run
    Probe {
        host: String,
        port: u16,
        #[arg(long)]
        https: bool,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Pack, unpack or summarize projects
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
}

#[derive(Subcommand)]
enum ImageCommand {
    /// Print the header and backing chain
    Info { path: PathBuf },
    /// Point an image at a new base image
    Rebase {
        image: PathBuf,
        base: PathBuf,
        #[arg(long)]
        backing_format: Option<String>,
        /// Image tool to run (defaults to controller.image_tool)
        #[arg(long)]
        tool: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Pack a project directory into one portable file
    Export {
        dir: PathBuf,
        archive: PathBuf,
        /// stored, zstd or snappy
        #[arg(long, default_value = "zstd")]
        codec: String,
    },
    /// Unpack a portable project
    Import { archive: PathBuf, dest: PathBuf },
    /// Summarize a topology file
    Show { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("loom", cli.json_logs);
    let config_path = cli.config.clone().unwrap_or_else(ControllerConfig::default_path);
    let config = ControllerConfig::load(&config_path)?;

    match cli.command {
        Commands::Image { command } => image(command, &config).await,
        Commands::Console {
            listen,
            remote,
            name,
            raw,
        } => console(&config, name, listen, remote, raw).await,
        Commands::Probe {
            host,
            port,
            https,
            user,
            password,
        } => {
            let protocol = if https { Protocol::Https } else { Protocol::Http };
            let mut descriptor = ComputeDescriptor::new("probe", protocol, host, port);
            descriptor.user = user;
            descriptor.password = password;
            descriptor.validate()?;
            let client =
                HttpComputeClient::new(&descriptor, Duration::from_secs(10), CancellationToken::new())?;
            let caps = client
                .capabilities()
                .await
                .with_context(|| format!("probing {}", descriptor.base_url()))?;
            println!("{}", serde_json::to_string_pretty(&caps)?);
            Ok(())
        }
        Commands::Project { command } => project(command),
    }
}

async fn image(command: ImageCommand, config: &ControllerConfig) -> Result<()> {
    match command {
        ImageCommand::Info { path } => {
            let chain = resolve_chain(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            for (depth, link) in chain.iter().enumerate() {
                let indent = "  ".repeat(depth);
                match &link.header {
                    Some(h) => println!(
                        "{}{} (qcow2 v{}, {} bytes, cluster {}, {})",
                        indent,
                        link.path.display(),
                        h.version,
                        h.size,
                        1u64 << h.cluster_bits.clamp(0, 63),
                        if h.is_encrypted() { "encrypted" } else { "plain" }
                    ),
                    None => println!("{}{} (not qcow2)", indent, link.path.display()),
                }
            }
            Ok(())
        }
        ImageCommand::Rebase {
            image,
            base,
            backing_format,
            tool,
        } => {
            let tool = tool.unwrap_or_else(|| config.controller.image_tool.clone());
            let mut img = Qcow2Image::open(&image)
                .await
                .with_context(|| format!("opening {}", image.display()))?;
            log_operation!(
                "image.rebase",
                img.rebase(&tool, &base, backing_format.as_deref()).await
            )?;
            let backing = img.backing_file().await?;
            println!(
                "{} now backed by {}",
                image.display(),
                backing.as_deref().unwrap_or("nothing")
            );
            Ok(())
        }
    }
}

async fn console(
    config: &ControllerConfig,
    name: String,
    listen: SocketAddr,
    remote: String,
    raw: bool,
) -> Result<()> {
    let mut console = ConsoleConfig::new(name, listen, remote);
    console.heartbeat = config.console.heartbeat;
    console.reconnect = RetryPolicy::reconnect(config.console.reconnect_delay);
    if raw {
        console.telnet = TelnetOptions::none();
    }

    let mux = ConsoleMultiplexer::start(console).await?;
    println!("Console listening on {}", mux.local_addr());
    tokio::signal::ctrl_c().await?;
    mux.shutdown().await;
    Ok(())
}

fn project(command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Export {
            dir,
            archive,
            codec,
        } => {
            let registry = CodecRegistry::with_defaults();
            let method = registry
                .by_name(&codec)
                .with_context(|| format!("known codecs: {}", registry.names().join(", ")))?
                .id();
            if find_topology(&dir)?.is_none() {
                bail!("{} holds no .{} file", dir.display(), TOPOLOGY_EXTENSION);
            }
            let out = BufWriter::new(
                fs::File::create(&archive).with_context(|| format!("creating {}", archive.display()))?,
            );
            let mut out = log_operation!("project.export", pack_dir(&dir, out, registry, method))?;
            out.flush()
                .with_context(|| format!("writing {}", archive.display()))?;
            println!("Exported {} to {}", dir.display(), archive.display());
            Ok(())
        }
        ProjectCommand::Import { archive, dest } => {
            let input = BufReader::new(
                fs::File::open(&archive).with_context(|| format!("opening {}", archive.display()))?,
            );
            let names = log_operation!(
                "project.import",
                unpack_dir(input, &dest, CodecRegistry::with_defaults())
            )?;
            let Some(file) = find_topology(&dest)? else {
                bail!("{} contained no topology", archive.display());
            };
            let doc = read_document(&file)?;
            println!(
                "Imported {} ({} files) as project {} into {}",
                doc.name,
                names.len(),
                doc.project_id,
                dest.display()
            );
            Ok(())
        }
        ProjectCommand::Show { file } => {
            let doc = read_document(&file)?;
            println!("{} ({})", doc.name, doc.project_id);
            for node in &doc.topology.nodes {
                println!("  node {} [{}] on {}", node.name, node.node_type, node.compute_id);
            }
            for link in &doc.topology.links {
                let [a, b] = &link.nodes;
                let name = |id: loom_model::NodeId| {
                    doc.topology
                        .nodes
                        .iter()
                        .find(|n| n.node_id == id)
                        .map(|n| n.name.as_str())
                        .unwrap_or("?")
                };
                println!(
                    "  link {} {}/{} <-> {} {}/{}",
                    name(a.node_id),
                    a.adapter_number,
                    a.port_number,
                    name(b.node_id),
                    b.adapter_number,
                    b.port_number
                );
            }
            println!("  {} shape(s)", doc.topology.shapes.len());
            Ok(())
        }
    }
}

fn find_topology(dir: &Path) -> Result<Option<PathBuf>> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(TOPOLOGY_EXTENSION) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn read_document(path: &Path) -> Result<TopologyDocument> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    TopologyDocument::from_json(&bytes).with_context(|| format!("parsing {}", path.display()))
}
