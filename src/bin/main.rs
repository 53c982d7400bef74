// vidswarm - src/bin/main.rs
//
// Runs one node: shares a folder, discovers peers on the LAN and optionally downloads a video.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};

use vidswarm::catalog::build_local_catalog;
use vidswarm::config::NodeConfig;
use vidswarm::control_client::ControlClient;
use vidswarm::control_server::ControlServer;
use vidswarm::download_manager::{DownloadManager, TransferEvent, TransferRequest};
use vidswarm::file_manager::{finalize, staging_path};
use vidswarm::logging::init_logger;
use vidswarm::metadata::SearchResult;
use vidswarm::p2p_manager::{DiscoveryEvent, P2PManager};
use vidswarm::peer_directory::PeerDirectory;

/// Share videos with peers on the local network and stream them from several sources at once.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name shown to other peers.
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port for catalog and chunk requests.
    #[arg(long)]
    control_port: Option<u16>,

    /// Folder whose videos are shared.
    #[arg(short, long)]
    share: Option<PathBuf>,

    /// Download the first video whose name contains this text, then exit.
    #[arg(short, long)]
    fetch: Option<String>,

    /// Folder downloads are written into.
    #[arg(short, long, default_value = "downloads")]
    out: PathBuf,

    /// [Fetch only] How long to wait for a peer offering a match.
    #[arg(long, default_value_t = 15, requires = "fetch")]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Could not load configuration")?;
    if let Some(name) = args.name {
        config.peer_name = name;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }

    let peer_id = uuid::Uuid::new_v4().to_string();
    info!(peer_id = %peer_id, name = %config.peer_name, "Starting node");

    let directory = PeerDirectory::new();
    if let Some(root) = args.share.clone() {
        let records = tokio::task::spawn_blocking(move || build_local_catalog(&root)).await??;
        directory.set_local_catalog(records);
    }

    let control_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.control_port));
    let mut server = ControlServer::start(control_addr, directory.clone())
        .await
        .with_context(|| format!("Could not bind control port {}", config.control_port))?;

    let (mut discovery, events) = P2PManager::new(config.clone(), peer_id, directory.clone());
    discovery.start().context("Could not join the discovery group")?;
    let catalog_task = tokio::spawn(refresh_catalogs(events, directory.clone(), config.catalog_timeout()));

    let outcome = match args.fetch {
        Some(query) => fetch(&directory, &config, &query, &args.out, Duration::from_secs(args.wait_secs)).await,
        None => {
            info!("Serving until Ctrl-C");
            tokio::signal::ctrl_c().await.context("Could not listen for Ctrl-C")
        }
    };

    catalog_task.abort();
    discovery.stop();
    server.stop();
    outcome
}

/// Fetches the catalog of every newly discovered peer into the directory.
async fn refresh_catalogs(mut events: mpsc::UnboundedReceiver<DiscoveryEvent>, directory: PeerDirectory, timeout: Duration) {
    let client = ControlClient::new();
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::PeerDiscovered(peer) => {
                let client = client.clone();
                let directory = directory.clone();
                tokio::spawn(async move {
                    match client.fetch_catalog(&peer, timeout).await {
                        Ok(files) => {
                            info!(peer = %peer, files = files.len(), "Catalog updated");
                            directory.set_peer_catalog(&peer.id, files);
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Catalog fetch failed"),
                    }
                });
            }
            DiscoveryEvent::ListenerFailed(reason) => warn!(%reason, "Discovery listener stopped"),
        }
    }
}

async fn wait_for_match(directory: &PeerDirectory, query: &str, wait: Duration) -> Option<SearchResult> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let hit = directory.search(query).into_iter().find(|result| !result.sources.is_empty());
        if hit.is_some() || tokio::time::Instant::now() >= deadline {
            return hit;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn fetch(directory: &PeerDirectory, config: &NodeConfig, query: &str, out: &Path, wait: Duration) -> Result<()> {
    let Some(hit) = wait_for_match(directory, query, wait).await else {
        bail!("No peer offered a video matching {:?} within {:?}", query, wait);
    };
    info!(file = %hit, "Downloading");

    let staging = staging_path(out, &hit.display_name, &hit.content_hash);
    let request = TransferRequest::from_search(&hit, &staging, config);
    let manager = DownloadManager::default();
    let mut handle = manager.start(request).await?;

    let bar = ProgressBar::new(hit.size_bytes);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    bar.set_message(hit.display_name.clone());

    let mut events = handle.events().context("Transfer events already taken")?;
    while let Some(event) = events.next().await {
        match event {
            TransferEvent::Buffer(status) => {
                bar.set_position((status.progress_fraction() * hit.size_bytes as f64) as u64);
            }
            TransferEvent::ReadyToPlay { path } => {
                bar.suspend(|| info!(path = ?path, "Ready to play"));
            }
            TransferEvent::Completed { .. } => break,
            TransferEvent::Stopped => bail!("Transfer stopped before completion"),
            _ => {}
        }
    }
    bar.finish();

    let done = finalize(&staging, &hit.display_name).await?;
    info!(path = ?done, "Saved");
    Ok(())
}
