use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::bucket::Bucket;
use super::error::DhtError;
use super::node::{Node, NodeId, ID_BITS};
use super::snapshot::{unix_secs, BucketSnapshot, TableSnapshot};

/// A peer is evicted after this many unanswered liveness pings in a row.
const MAX_FAILURES: u8 = 2;
const COMMAND_CAPACITY: usize = 1024;

/// Sends liveness pings on behalf of the routing table.
///
/// Any inbound message from the pinged node that reaches
/// [`RoutingTable::notify`] counts as the answer.
pub trait LivenessProbe: Send + Sync + 'static {
    fn ping(&self, node: &Node);
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Bucket capacity, for both the active and the candidate list.
    pub k: usize,
    pub liveness_interval: Duration,
    pub ping_timeout: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            k: 8,
            liveness_interval: Duration::from_secs(15 * 60),
            ping_timeout: Duration::from_secs(1),
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub active: usize,
    pub candidates: usize,
    pub known: usize,
}

enum Command {
    Notify(Node),
    Closest {
        target: NodeId,
        count: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Snapshot {
        reply: oneshot::Sender<TableSnapshot>,
    },
    StaleBuckets {
        max_age: Duration,
        reply: oneshot::Sender<Vec<usize>>,
    },
    Stats {
        reply: oneshot::Sender<TableStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Time to check that an active peer is still there.
    Liveness,
    /// The ping sent on a liveness check went unanswered.
    Deadline,
}

#[derive(Debug)]
struct TimerFired {
    id: NodeId,
    generation: u64,
    kind: TimerKind,
}

/// Handle to the Kademlia routing table.
///
/// The table itself lives on a dedicated task that owns the buckets, the
/// peer map and every liveness timer; this handle only sends it messages, so
/// all mutations are serialized without locks. Cloning the handle is cheap.
#[derive(Clone)]
pub struct RoutingTable {
    our_id: NodeId,
    commands: mpsc::Sender<Command>,
}

impl RoutingTable {
    /// Starts the table task. It runs until [`shutdown`](Self::shutdown) is
    /// called or every handle is dropped, and writes a final snapshot on the
    /// way out. `cancel` stops pending liveness timers.
    pub fn spawn<P: LivenessProbe>(
        our_id: NodeId,
        config: TableConfig,
        probe: P,
        cancel: CancellationToken,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();

        let actor = TableActor {
            our_id,
            buckets: (0..ID_BITS).map(|_| Bucket::new(config.k)).collect(),
            config,
            probe,
            peers: HashMap::new(),
            next_generation: 0,
            timers_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(commands_rx, timers_rx));

        Self {
            our_id,
            commands: commands_tx,
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Records a sighting of `node`. Unknown peers are inserted, known ones
    /// get their address refreshed and their liveness state reset.
    pub async fn notify(&self, node: Node) {
        let _ = self.commands.send(Command::Notify(node)).await;
    }

    /// Replays a stored snapshot through [`notify`](Self::notify). Active
    /// peers go in back to front so the stored recency order survives.
    pub async fn restore(&self, snapshot: &TableSnapshot) -> usize {
        let mut replayed = 0;
        for bucket in &snapshot.buckets {
            for node in bucket.active.iter().rev() {
                self.notify(*node).await;
                replayed += 1;
            }
        }
        for bucket in &snapshot.buckets {
            for node in bucket.candidates.iter().rev() {
                self.notify(*node).await;
                replayed += 1;
            }
        }
        replayed
    }

    /// Up to `count` active peers in ascending XOR distance from `target`.
    pub async fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Closest {
            target: *target,
            count,
            reply,
        };
        if self.commands.send(cmd).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Result<TableSnapshot, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| DhtError::TableStopped)?;
        rx.await.map_err(|_| DhtError::TableStopped)
    }

    /// Indices of non-empty buckets not updated within `max_age`.
    pub async fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::StaleBuckets { max_age, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> TableStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).await.is_err() {
            return TableStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops the table task after it writes its final snapshot.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PeerEntry {
    addr: SocketAddr,
    failures: u8,
    /// Only a timer carrying the current generation is acted upon. A timer
    /// that already fired may still be queued when the next one is armed.
    generation: u64,
    timer: Option<AbortHandle>,
}

impl PeerEntry {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct TableActor<P> {
    our_id: NodeId,
    config: TableConfig,
    probe: P,
    buckets: Vec<Bucket>,
    peers: HashMap<NodeId, PeerEntry>,
    next_generation: u64,
    timers_tx: mpsc::UnboundedSender<TimerFired>,
    cancel: CancellationToken,
}

impl<P: LivenessProbe> TableActor<P> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        let mut snapshot_tick = interval(self.config.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        snapshot_tick.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.persist().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(fired) = timers.recv() => self.on_timer(fired),
                _ = snapshot_tick.tick() => self.persist().await,
            }
        }

        self.persist().await;
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Notify(node) => self.notify(node),
            Command::Closest {
                target,
                count,
                reply,
            } => {
                let _ = reply.send(self.closest(&target, count));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.to_snapshot());
            }
            Command::StaleBuckets { max_age, reply } => {
                let _ = reply.send(self.stale(max_age));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn notify(&mut self, node: Node) {
        let Some(index) = self.our_id.bucket_index(&node.id) else {
            trace!("ignoring sighting of our own id from {}", node.addr);
            return;
        };

        self.peers
            .entry(node.id)
            .and_modify(|e| e.addr = node.addr)
            .or_insert(PeerEntry {
                addr: node.addr,
                failures: 0,
                generation: 0,
                timer: None,
            });

        let bucket = &mut self.buckets[index];
        if bucket.refresh(&node.id) {
            if let Some(entry) = self.peers.get_mut(&node.id) {
                entry.failures = 0;
            }
            self.arm(node.id, TimerKind::Liveness, self.config.liveness_interval);
        } else if !bucket.is_full() {
            bucket.insert_active(node.id);
            self.arm(node.id, TimerKind::Liveness, self.config.liveness_interval);
        } else if let Some(dropped) = bucket.push_candidate(node.id) {
            self.forget(&dropped);
        }
    }

    fn arm(&mut self, id: NodeId, kind: TimerKind, delay: Duration) {
        let Some(entry) = self.peers.get_mut(&id) else {
            return;
        };
        entry.disarm();
        self.next_generation += 1;
        entry.generation = self.next_generation;

        let fired = TimerFired {
            id,
            generation: self.next_generation,
            kind,
        };
        let tx = self.timers_tx.clone();
        let cancel = self.cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = tx.send(fired);
                }
            }
        });
        entry.timer = Some(timer.abort_handle());
    }

    fn forget(&mut self, id: &NodeId) {
        if let Some(mut entry) = self.peers.remove(id) {
            entry.disarm();
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let Some(entry) = self.peers.get_mut(&fired.id) else {
            return;
        };
        if entry.generation != fired.generation {
            return;
        }
        let Some(index) = self.our_id.bucket_index(&fired.id) else {
            return;
        };
        if !self.buckets[index].is_active(&fired.id) {
            return;
        }

        let node = Node::new(fired.id, entry.addr);
        match fired.kind {
            TimerKind::Liveness => {
                trace!("liveness check for {} at {}", node.id, node.addr);
            }
            TimerKind::Deadline => {
                entry.failures += 1;
                if entry.failures >= MAX_FAILURES {
                    self.evict(index, &fired.id);
                    return;
                }
                debug!("{} missed a ping, retrying", node.addr);
            }
        }

        self.probe.ping(&node);
        self.arm(fired.id, TimerKind::Deadline, self.config.ping_timeout);
    }

    fn evict(&mut self, index: usize, id: &NodeId) {
        self.buckets[index].remove_active(id);
        self.forget(id);
        debug!("evicted unresponsive node {} from bucket {}", id, index);

        if let Some(promoted) = self.buckets[index].promote_candidate() {
            if let Some(entry) = self.peers.get_mut(&promoted) {
                entry.failures = 0;
            }
            self.arm(promoted, TimerKind::Liveness, self.config.liveness_interval);
        }
    }

    fn closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut closest: Vec<([u8; 20], Node)> = Vec::with_capacity(count + 1);

        for bucket in &self.buckets {
            for id in bucket.active() {
                let Some(entry) = self.peers.get(id) else {
                    continue;
                };
                let dist = target.distance(id);
                // After any equal distances, so earlier sightings win ties.
                let pos = closest.partition_point(|(d, _)| *d <= dist);
                if pos < count {
                    closest.insert(pos, (dist, Node::new(*id, entry.addr)));
                    closest.truncate(count);
                }
            }
        }

        closest.into_iter().map(|(_, node)| node).collect()
    }

    fn stale(&self, max_age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .filter(|(_, b)| {
                b.last_updated()
                    .elapsed()
                    .map(|age| age > max_age)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn stats(&self) -> TableStats {
        TableStats {
            active: self.buckets.iter().map(Bucket::active_len).sum(),
            candidates: self.buckets.iter().map(Bucket::candidate_len).sum(),
            known: self.peers.len(),
        }
    }

    fn resolve<'a>(&self, ids: impl Iterator<Item = &'a NodeId>) -> Vec<Node> {
        ids.filter_map(|id| self.peers.get(id).map(|e| Node::new(*id, e.addr)))
            .collect()
    }

    fn to_snapshot(&self) -> TableSnapshot {
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(index, b)| BucketSnapshot {
                index,
                last_updated: unix_secs(b.last_updated()),
                active: self.resolve(b.active()),
                candidates: self.resolve(b.candidates()),
            })
            .collect();

        TableSnapshot {
            owner_id: self.our_id,
            saved_at: unix_secs(SystemTime::now()),
            buckets,
        }
    }

    async fn persist(&self) {
        let Some(path) = self.config.snapshot_path.as_deref() else {
            return;
        };

        let snapshot = self.to_snapshot();
        match snapshot.save(path).await {
            Ok(()) => info!(
                "saved routing table ({} active, {} candidates) to {}",
                snapshot.active_count(),
                snapshot.candidate_count(),
                path.display()
            ),
            Err(e) => warn!("failed to save routing table to {}: {}", path.display(), e),
        }
    }
}
