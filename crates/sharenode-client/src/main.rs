//! Sharenode - peer-to-peer file sharing node

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sharenode_client::config::{expand_path, Config};
use sharenode_client::node::download_path;
use sharenode_client::speed::format_rate;
use sharenode_client::{Node, NodeEvent, NodeSettings, SharedCatalog, Transfer, Verification};
use sharenode_core::transport::mock::MockNetwork;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long the demo waits for any single step
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "sharenode")]
#[command(about = "Peer-to-peer file sharing over an encrypted channel", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.sharenode/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Hash files and print the catalog entries they would be shared as
    Share {
        /// Files to share
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Transfer a file between two in-process nodes over the mock network
    Demo {
        /// File to transfer
        #[arg(required = true)]
        file: PathBuf,

        /// Directory to download into (defaults to the configured download_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and protocol constants
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Share { files } => share_files(&files)?,
        Commands::Demo { file, output } => {
            let config = load_config(&config_path)?;
            run_demo(&config, &file, output).await?;
        }
        Commands::Status => show_status(&config_path)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let config = Config::default();
    config.save(config_path)?;

    std::fs::create_dir_all(config.data_dir())?;
    std::fs::create_dir_all(config.transfer.download_dir())?;

    println!("Initialized Sharenode at: {}", config.data_dir().display());
    println!("Config: {}", config_path.display());
    Ok(())
}

fn share_files(files: &[PathBuf]) -> Result<()> {
    let catalog = SharedCatalog::new();
    for path in files {
        match catalog.share(path) {
            Ok(file) => tracing::debug!("Shared {}", file.path.display()),
            Err(e) => tracing::error!("Failed to share {}: {}", path.display(), e),
        }
    }

    let entries = catalog.entries();
    if entries.is_empty() {
        anyhow::bail!("No files could be shared");
    }
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn show_status(config_path: &Path) -> Result<()> {
    println!("Sharenode v{}", env!("CARGO_PKG_VERSION"));
    println!("Segment size: {} bytes", sharenode_core::SEGMENT_SIZE);
    println!("Channels: {}", sharenode_core::CHANNEL_COUNT);

    let config = load_config(config_path)?;
    println!("Disconnect timeout: {:?}", config.network.disconnect_timeout());
    println!("Missing-segment retry: {:?}", config.network.retry_interval());
    println!("Download directory: {}", config.transfer.download_dir().display());
    println!("Shared files: {}", config.shared.len());
    Ok(())
}

async fn run_demo(config: &Config, file: &Path, output: Option<PathBuf>) -> Result<()> {
    let network = MockNetwork::new();
    let server_addr: SocketAddr = "127.0.0.1:7400".parse()?;
    let client_addr: SocketAddr = "127.0.0.1:7401".parse()?;

    let settings = NodeSettings::from(config);
    let server = Arc::new(Node::new(network.transport(server_addr), settings.clone()));
    let client = Arc::new(Node::new(network.transport(client_addr), settings));

    let shared = server.share(file)?;
    let pending = shared.clone();
    tokio::task::spawn_blocking(move || pending.compute_hash()).await??;
    for path in &config.shared {
        if let Err(e) = server.share(path) {
            tracing::warn!("Skipping {}: {}", path.display(), e);
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut client_events = client.subscribe();
    let mut tasks = Vec::new();
    for node in [server.clone(), client.clone()] {
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { node.run(shutdown).await }));
    }

    let dir = output.unwrap_or_else(|| config.transfer.download_dir());
    let result: Result<()> = async {
        let peer = client.connect(server_addr)?;
        wait_for(&mut client_events, |e| matches!(e, NodeEvent::PeerReady(p) if *p == peer)).await?;
        println!("Secure session established with {}", server_addr);

        client.request_files_list(peer)?;
        let entries = match wait_for(&mut client_events, |e| {
            matches!(e, NodeEvent::CatalogReceived { .. })
        })
        .await?
        {
            NodeEvent::CatalogReceived { entries, .. } => entries,
            other => anyhow::bail!("Unexpected event {:?}", other),
        };
        println!("Server shares {} file(s)", entries.len());

        let entry = entries
            .iter()
            .find(|e| e.index == shared.index)
            .context("Shared file missing from catalog")?;
        std::fs::create_dir_all(&dir)?;
        let dest = download_path(&dir, entry);

        let started = Instant::now();
        let download = client.start_download(peer, entry, &dest)?;
        println!(
            "Downloading {} ({} bytes, {} segments) to {}",
            entry.name,
            entry.size,
            entry.segment_count,
            dest.display()
        );

        let id = download.id();
        let verification = match wait_for(&mut client_events, |e| {
            matches!(e, NodeEvent::DownloadVerified { id: v, .. } if *v == id)
                || matches!(e, NodeEvent::DownloadCancelled(c) if *c == id)
        })
        .await?
        {
            NodeEvent::DownloadVerified { verification, .. } => verification,
            _ => anyhow::bail!("Download was cancelled"),
        };

        println!(
            "Done in {:.2?}: {} received, average {}",
            started.elapsed(),
            download.bytes_downloaded(),
            format_rate(download.average(Instant::now()))
        );
        match verification {
            Verification::Positive => println!("Hash verified"),
            other => anyhow::bail!("Hash verification result: {:?}", other),
        }
        Ok(())
    }
    .await;

    let _ = shutdown_tx.send(());
    for task in tasks {
        let _ = task.await;
    }
    result
}

/// Wait for the first node event matching `pred`
async fn wait_for<F>(events: &mut broadcast::Receiver<NodeEvent>, pred: F) -> Result<NodeEvent>
where
    F: Fn(&NodeEvent) -> bool,
{
    tokio::time::timeout(DEMO_STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} node events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("Node stopped")
                }
            }
        }
    })
    .await
    .context("Timed out waiting for node")?
}
