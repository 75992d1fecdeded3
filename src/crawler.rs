//! Wires the DHT into the collector: every harvested announce becomes a
//! metadata fetch, subject to admission control.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::{Collector, CollectorError, FetchRequest, ResultHandler};
use crate::config::CrawlerConfig;
use crate::dht::{DhtError, DhtServer, NodeId, PeerAnnouncement};
use crate::metadata::{FetchError, PeerFetcher};
use crate::torrent::Torrent;

/// Called for every torrent whose metadata was fetched and verified.
pub type TorrentHandler = Arc<dyn Fn(&FetchRequest, &Torrent) + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    announces: AtomicU64,
    rejected: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlerStats {
    pub announces: u64,
    /// Announces dropped because every fetch slot was taken.
    pub rejected: u64,
    pub resolved: u64,
    pub failed: u64,
}

/// A DHT crawler: harvests `announce_peer` messages and resolves each
/// announced info-hash into a [`Torrent`].
///
/// ```no_run
/// use std::sync::Arc;
/// use rcrawl::config::CrawlerConfig;
/// use rcrawl::crawler::Crawler;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let crawler = Crawler::new(
///     CrawlerConfig::default(),
///     Arc::new(|_request, torrent| println!("{} {}", torrent.info_hash_hex(), torrent.name())),
/// )
/// .await?;
///
/// crawler.run(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Crawler {
    server: DhtServer,
    collector: Collector,
    counters: Arc<Counters>,
}

impl Crawler {
    /// Starts the collector and binds the DHT node. Must be called within a
    /// tokio runtime.
    pub async fn new(config: CrawlerConfig, on_torrent: TorrentHandler) -> Result<Self, DhtError> {
        let counters = Arc::new(Counters::default());

        let on_result: ResultHandler = {
            let counters = counters.clone();
            Arc::new(
                move |request: &FetchRequest, result: &Result<Torrent, FetchError>| match result {
                    Ok(torrent) => {
                        counters.resolved.fetch_add(1, Ordering::Relaxed);
                        on_torrent(request, torrent);
                    }
                    Err(_) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )
        };

        let collector = Collector::new(
            &config.collector,
            PeerFetcher::new(config.fetch.clone()),
            on_result,
        );

        let on_announce = {
            let collector = collector.clone();
            let counters = counters.clone();
            Arc::new(move |announce: PeerAnnouncement| {
                counters.announces.fetch_add(1, Ordering::Relaxed);
                let request = FetchRequest::from(announce);
                match collector.get(request) {
                    Ok(()) => {}
                    Err(CollectorError::AtCapacity) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "dropping announce of {} from {}: collector at capacity",
                            request.info_hash_hex(),
                            request.addr
                        );
                    }
                    Err(CollectorError::Stopped) => {
                        debug!("ignoring announce of {}: collector stopped", request.info_hash_hex());
                    }
                }
            })
        };

        let server = match DhtServer::bind(config.dht, on_announce).await {
            Ok(server) => server,
            Err(e) => {
                collector.stop();
                return Err(e);
            }
        };

        Ok(Self {
            server,
            collector,
            counters,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.server.our_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// A handle that keeps reporting after `run` has consumed the crawler.
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle(self.counters.clone())
    }

    /// Crawls until `shutdown` fires, then stops the collector. Fetches that
    /// are still running finish in the background.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DhtError> {
        let result = self.server.run(shutdown).await;
        self.collector.stop();

        let stats = StatsHandle(self.counters).get();
        info!(
            "crawler stopped: {} announces, {} resolved, {} failed, {} rejected",
            stats.announces, stats.resolved, stats.failed, stats.rejected
        );
        result
    }
}

#[derive(Debug, Clone)]
pub struct StatsHandle(Arc<Counters>);

impl StatsHandle {
    pub fn get(&self) -> CrawlerStats {
        CrawlerStats {
            announces: self.0.announces.load(Ordering::Relaxed),
            rejected: self.0.rejected.load(Ordering::Relaxed),
            resolved: self.0.resolved.load(Ordering::Relaxed),
            failed: self.0.failed.load(Ordering::Relaxed),
        }
    }
}
