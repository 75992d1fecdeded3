use std::io::ErrorKind;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::DhtError;
use super::message::{
    new_transaction_id, DhtMessage, DhtQuery, DhtResponse, TransactionId, ERROR_METHOD_UNKNOWN,
};
use super::node::{Node, NodeId};
use super::routing::{LivenessProbe, RoutingTable};
use super::snapshot::TableSnapshot;
use crate::config::DhtConfig;

const MAX_DATAGRAM: usize = 65535;
const DISCOVERY_CAPACITY: usize = 1024;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_LEN: usize = 8;

/// A peer announcing that it participates in the swarm for `info_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAnnouncement {
    /// The announcing peer's address, with the port it asked us to use.
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub node_id: NodeId,
}

/// Called on the datagram task for every `announce_peer`; must not block.
pub type AnnounceHandler = Arc<dyn Fn(PeerAnnouncement) + Send + Sync>;

/// Pings go straight out of the shared socket without waiting for it to be
/// writable. A dropped ping counts as an unanswered one.
struct UdpProbe {
    socket: Arc<UdpSocket>,
    our_id: NodeId,
}

impl LivenessProbe for UdpProbe {
    fn ping(&self, node: &Node) {
        let msg = DhtMessage::ping(new_transaction_id(), &self.our_id);
        if let Err(e) = self.socket.try_send_to(&msg.encode(), node.addr) {
            trace!("liveness ping to {} not sent: {}", node.addr, e);
        }
    }
}

struct Shared {
    socket: Arc<UdpSocket>,
    our_id: NodeId,
    k: usize,
    table: RoutingTable,
    token_secret: RwLock<[u8; 16]>,
    discovered: mpsc::Sender<Node>,
    on_announce: AnnounceHandler,
}

/// A crawling DHT node.
///
/// The server answers queries from other nodes, harvests their
/// `announce_peer` messages, and keeps the routing table churning by sending
/// `find_node` to every node it hears about. It never performs converging
/// lookups of its own.
///
/// ```no_run
/// use std::sync::Arc;
/// use rcrawl::config::DhtConfig;
/// use rcrawl::dht::{DhtServer, PeerAnnouncement};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = DhtServer::bind(
///     DhtConfig::default(),
///     Arc::new(|announce: PeerAnnouncement| println!("{:?}", announce)),
/// )
/// .await?;
///
/// server.run(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct DhtServer {
    shared: Arc<Shared>,
    config: DhtConfig,
    local_addr: SocketAddr,
    discovered_rx: mpsc::Receiver<Node>,
    timers: CancellationToken,
}

impl DhtServer {
    /// Binds the UDP endpoint and starts the routing table, restoring it from
    /// the configured snapshot when one exists.
    ///
    /// Without an explicit node id the snapshot's owner id is adopted, so
    /// restored peers land in the buckets they were saved from.
    pub async fn bind(config: DhtConfig, on_announce: AnnounceHandler) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let snapshot = match config.snapshot_path.as_deref() {
            Some(path) => match TableSnapshot::load(path).await {
                Ok(snapshot) => Some(snapshot),
                Err(DhtError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!("no routing table snapshot at {}", path.display());
                    None
                }
                Err(e) => {
                    warn!("ignoring unreadable snapshot {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        let configured = config
            .node_id
            .as_deref()
            .map(NodeId::from_hex)
            .transpose()?;
        let our_id = configured
            .or_else(|| snapshot.as_ref().map(|s| s.owner_id))
            .unwrap_or_else(NodeId::generate);

        let timers = CancellationToken::new();
        let probe = UdpProbe {
            socket: socket.clone(),
            our_id,
        };
        let table = RoutingTable::spawn(our_id, config.table_config(), probe, timers.clone());

        if let Some(snapshot) = &snapshot {
            let replayed = table.restore(snapshot).await;
            info!("restored {} nodes from routing table snapshot", replayed);
        }

        info!("DHT node {} listening on {}", our_id, local_addr);

        let (discovered, discovered_rx) = mpsc::channel(DISCOVERY_CAPACITY);
        let shared = Arc::new(Shared {
            socket,
            our_id,
            k: config.k,
            table,
            token_secret: RwLock::new(rand::random()),
            discovered,
            on_announce,
        });

        Ok(Self {
            shared,
            config,
            local_addr,
            discovered_rx,
            timers,
        })
    }

    pub fn our_id(&self) -> &NodeId {
        &self.shared.our_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.shared.table
    }

    /// Bootstraps, then serves and crawls until `shutdown` fires. The routing
    /// table writes its final snapshot before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DhtError> {
        let Self {
            shared,
            config,
            discovered_rx,
            timers,
            ..
        } = self;

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = shared.bootstrap(&config.bootstrap_nodes) => {}
        }

        tokio::join!(
            Shared::recv_loop(shared.clone(), shutdown.clone()),
            shared.join_loop(&config, discovered_rx, shutdown),
        );

        info!("DHT node shutting down");
        timers.cancel();
        shared.table.shutdown().await;
        Ok(())
    }
}

impl Shared {
    async fn recv_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (n, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here.
                    trace!("recv_from failed: {}", e);
                    continue;
                }
            };

            let data = buf[..n].to_vec();
            let shared = self.clone();
            tokio::spawn(async move {
                let handled = AssertUnwindSafe(shared.handle_datagram(&data, from))
                    .catch_unwind()
                    .await;
                if handled.is_err() {
                    warn!("handler panicked on datagram from {}", from);
                }
            });
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let msg = match DhtMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };

        if let Some(id) = msg.sender() {
            self.table.notify(Node::new(*id, from)).await;
        }

        match msg {
            DhtMessage::Query {
                transaction_id,
                sender,
                query,
            } => self.handle_query(transaction_id, sender, query, from).await,
            DhtMessage::Response { response, .. } => {
                for node in response.nodes() {
                    if node.id == self.our_id {
                        continue;
                    }
                    if self.discovered.try_send(*node).is_err() {
                        trace!("discovery queue full, dropping {}", node.addr);
                    }
                }
            }
            DhtMessage::Error { code, message, .. } => {
                debug!("error {} from {}: {}", code, from, message);
            }
        }
    }

    async fn handle_query(
        &self,
        tid: TransactionId,
        sender: NodeId,
        query: DhtQuery,
        from: SocketAddr,
    ) {
        let response = match query {
            DhtQuery::Ping => DhtResponse::Ping { id: self.our_id },
            DhtQuery::FindNode { target } => DhtResponse::FindNode {
                id: self.our_id,
                nodes: self.table.closest_nodes(&target, self.k).await,
            },
            DhtQuery::GetPeers { info_hash } => DhtResponse::GetPeers {
                id: self.our_id,
                token: self.token_for(&info_hash),
                nodes: self.table.closest_nodes(&NodeId(info_hash), self.k).await,
                values: Vec::new(),
            },
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                ..
            } => {
                let port = if implied_port { from.port() } else { port };
                let announcement = PeerAnnouncement {
                    addr: SocketAddr::new(from.ip(), port),
                    info_hash,
                    node_id: sender,
                };
                debug!(
                    "announce for {} from {}",
                    hex::encode(info_hash),
                    announcement.addr
                );
                (self.on_announce)(announcement);
                DhtResponse::Ping { id: self.our_id }
            }
            DhtQuery::Unknown { method } => {
                debug!("unknown method {:?} from {}", method, from);
                let reply = DhtMessage::error(tid, ERROR_METHOD_UNKNOWN, "Method Unknown");
                self.send(&reply, from).await;
                return;
            }
        };

        self.send(&DhtMessage::response(tid, response), from).await;
    }

    async fn send(&self, msg: &DhtMessage, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(&msg.encode(), to).await {
            debug!("send to {} failed: {}", to, e);
        }
    }

    async fn find_node(&self, to: SocketAddr, target: NodeId) {
        let msg = DhtMessage::find_node(new_transaction_id(), &self.our_id, target);
        self.send(&msg, to).await;
    }

    async fn bootstrap(&self, hosts: &[String]) {
        for host in hosts {
            let resolved = match timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host(host)).await {
                Ok(Ok(addrs)) => addrs.into_iter().find(SocketAddr::is_ipv4),
                Ok(Err(e)) => {
                    warn!("failed to resolve bootstrap node {}: {}", host, e);
                    continue;
                }
                Err(_) => {
                    warn!("timed out resolving bootstrap node {}", host);
                    continue;
                }
            };

            if let Some(addr) = resolved {
                debug!("bootstrapping via {} ({})", host, addr);
                self.find_node(addr, NodeId::generate()).await;
            }
        }
    }

    /// Keeps the table populated: every discovered node gets a `find_node`
    /// toward a fresh random target, and after `join_interval` without
    /// discoveries the closest known nodes to a random target are queried.
    async fn join_loop(
        &self,
        config: &DhtConfig,
        mut discovered: mpsc::Receiver<Node>,
        shutdown: CancellationToken,
    ) {
        let mut idle = interval(config.join_interval());
        let mut refresh = interval(config.bucket_refresh());
        let mut rotation = interval(config.token_rotation());
        for timer in [&mut idle, &mut refresh, &mut rotation] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        idle.tick().await;
        refresh.tick().await;
        rotation.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(node) = discovered.recv() => {
                    self.find_node(node.addr, NodeId::generate()).await;
                    idle.reset();
                }
                _ = idle.tick() => self.crawl_idle(&config.bootstrap_nodes).await,
                _ = refresh.tick() => self.refresh_stale_buckets(config.bucket_refresh()).await,
                _ = rotation.tick() => self.rotate_token_secret(),
            }
        }
    }

    async fn crawl_idle(&self, bootstrap_nodes: &[String]) {
        let target = NodeId::generate();
        let closest = self.table.closest_nodes(&target, self.k).await;
        if closest.is_empty() {
            debug!("routing table is empty, bootstrapping again");
            self.bootstrap(bootstrap_nodes).await;
            return;
        }

        for node in closest {
            self.find_node(node.addr, target).await;
        }
    }

    async fn refresh_stale_buckets(&self, max_age: Duration) {
        let stale = self.table.stale_buckets(max_age).await;
        if stale.is_empty() {
            return;
        }

        debug!("refreshing {} stale buckets", stale.len());
        for index in stale {
            let target = self.our_id.random_in_bucket(index);
            for node in self.table.closest_nodes(&target, self.k).await {
                self.find_node(node.addr, target).await;
            }
        }
    }

    /// Opaque `get_peers` token. Announces are harvested whether or not they
    /// echo it back.
    fn token_for(&self, info_hash: &[u8; 20]) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(*self.token_secret.read());
        hasher.update(info_hash);
        Bytes::copy_from_slice(&hasher.finalize()[..TOKEN_LEN])
    }

    fn rotate_token_secret(&self) {
        *self.token_secret.write() = rand::random();
        trace!("token secret rotated");
    }
}
