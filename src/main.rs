//! rcrawl - BitTorrent DHT crawler

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rcrawl::collector::FetchRequest;
use rcrawl::config::CrawlerConfig;
use rcrawl::crawler::{Crawler, TorrentHandler};
use rcrawl::torrent::Torrent;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rcrawl")]
#[command(about = "Crawl the BitTorrent DHT and resolve announced torrents", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP address for the DHT node
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Node id as 40 hex characters
    #[arg(long)]
    node_id: Option<String>,

    /// Routing table snapshot file
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Maximum number of concurrent metadata fetches
    #[arg(long)]
    max_pending: Option<usize>,

    /// Write every resolved torrent to <DIR>/<infohash>.torrent
    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn crawler_config(&self) -> Result<CrawlerConfig> {
        let mut config = match &self.config {
            Some(path) => CrawlerConfig::load(path)?,
            None => CrawlerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.dht.bind_addr = bind;
        }
        if let Some(node_id) = &self.node_id {
            config.dht.node_id = Some(node_id.clone());
            config.dht.node_id().context("--node-id")?;
        }
        if let Some(snapshot) = &self.snapshot {
            config.dht.snapshot_path = Some(snapshot.clone());
        }
        if let Some(max_pending) = self.max_pending {
            config.collector.max_pending = max_pending;
        }
        Ok(config)
    }
}

fn torrent_handler(save_dir: Option<PathBuf>) -> TorrentHandler {
    Arc::new(move |request: &FetchRequest, torrent: &Torrent| {
        info!(
            "{} {:?} ({} files, {} bytes) from {}",
            torrent.info_hash_hex(),
            torrent.name(),
            torrent.files().len(),
            torrent.total_length(),
            request.addr
        );

        if let Some(dir) = &save_dir {
            let path = dir.join(format!("{}.torrent", torrent.info_hash_hex()));
            let data = torrent.to_torrent_file();
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::write(&path, data).await {
                    warn!("failed to write {}: {}", path.display(), e);
                }
            });
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = cli.crawler_config()?;

    if let Some(dir) = &cli.save_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let crawler = Crawler::new(config, torrent_handler(cli.save_dir.clone()))
        .await
        .context("starting crawler")?;
    info!(
        "crawling as {} on {}",
        crawler.node_id(),
        crawler.local_addr()
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {}", e);
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    crawler.run(shutdown).await?;
    Ok(())
}
