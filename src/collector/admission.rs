use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::CollectorError;
use super::request::FetchRequest;
use crate::config::CollectorConfig;
use crate::metadata::FetchError;
use crate::torrent::Torrent;

/// Resolves one request into a torrent. The seam between admission and the
/// peer wire protocol.
pub trait MetadataFetch: Send + Sync + 'static {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<Torrent, FetchError>> + Send;
}

/// Runs on the fetch task once per admitted request, after its slot has been
/// released.
pub type ResultHandler = Arc<dyn Fn(&FetchRequest, &Result<Torrent, FetchError>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Admitted fetches whose completion has not been seen yet.
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Resolves exactly once with the outcome of a submitted fetch.
pub struct FetchTicket {
    rx: oneshot::Receiver<Result<Torrent, FetchError>>,
}

impl FetchTicket {
    pub async fn wait(self) -> Result<Torrent, FetchError> {
        self.rx.await.unwrap_or(Err(FetchError::Aborted))
    }
}

enum Command {
    Admit {
        request: FetchRequest,
        permit: OwnedSemaphorePermit,
        ticket: Option<oneshot::Sender<Result<Torrent, FetchError>>>,
    },
    Stats {
        reply: oneshot::Sender<CollectorStats>,
    },
}

/// Bounded-concurrency admission for metadata fetches.
///
/// At most `max_pending` fetches run at once. A request arriving while every
/// slot is taken fails immediately with [`CollectorError::AtCapacity`]; the
/// collector never blocks its caller and never queues. Each admitted request
/// runs on its own task and frees its slot exactly once, whichever way it
/// ends.
///
/// ```no_run
/// use std::sync::Arc;
/// use rcrawl::collector::Collector;
/// use rcrawl::config::{CollectorConfig, FetchConfig};
/// use rcrawl::metadata::PeerFetcher;
///
/// # async fn example(request: rcrawl::collector::FetchRequest) {
/// let collector = Collector::new(
///     &CollectorConfig::default(),
///     PeerFetcher::new(FetchConfig::default()),
///     Arc::new(|request, result| match result {
///         Ok(torrent) => println!("{} is {}", request.info_hash_hex(), torrent.name()),
///         Err(e) => println!("{} failed: {}", request.info_hash_hex(), e),
///     }),
/// );
///
/// if let Err(e) = collector.get(request) {
///     println!("dropped: {}", e);
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct Collector {
    permits: Arc<Semaphore>,
    capacity: usize,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl Collector {
    /// Starts the admission loop. Must be called within a tokio runtime.
    pub fn new<F: MetadataFetch>(
        config: &CollectorConfig,
        fetcher: F,
        on_result: ResultHandler,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let admission = Admission {
            fetcher: Arc::new(fetcher),
            on_result,
            stats: CollectorStats::default(),
        };
        tokio::spawn(admission.run(commands_rx, cancel.clone()));

        Self {
            permits: Arc::new(Semaphore::new(config.max_pending)),
            capacity: config.max_pending,
            commands,
            cancel,
        }
    }

    /// Hands `request` off for asynchronous processing.
    pub fn get(&self, request: FetchRequest) -> Result<(), CollectorError> {
        self.admit(request, None)
    }

    /// Like [`get`](Self::get), but returns a ticket for the outcome.
    pub fn submit(&self, request: FetchRequest) -> Result<FetchTicket, CollectorError> {
        let (tx, rx) = oneshot::channel();
        self.admit(request, Some(tx))?;
        Ok(FetchTicket { rx })
    }

    fn admit(
        &self,
        request: FetchRequest,
        ticket: Option<oneshot::Sender<Result<Torrent, FetchError>>>,
    ) -> Result<(), CollectorError> {
        if self.cancel.is_cancelled() {
            return Err(CollectorError::Stopped);
        }

        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => CollectorError::AtCapacity,
                TryAcquireError::Closed => CollectorError::Stopped,
            })?;

        self.commands
            .send(Command::Admit {
                request,
                permit,
                ticket,
            })
            .map_err(|_| CollectorError::Stopped)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free fetch slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn stats(&self) -> CollectorStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).is_err() {
            return CollectorStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Refuses further requests and stops the admission loop. Requests
    /// admitted before the call, and fetches already running, still finish
    /// and report through the result handler.
    pub fn stop(&self) {
        self.permits.close();
        self.cancel.cancel();
    }
}

struct Admission<F> {
    fetcher: Arc<F>,
    on_result: ResultHandler,
    stats: CollectorStats,
}

impl<F: MetadataFetch> Admission<F> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain(&mut commands, &done_tx);
                    break;
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Admit { request, permit, ticket }) => {
                        self.stats.pending += 1;
                        self.spawn_fetch(request, permit, ticket, done_tx.clone());
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats);
                    }
                    None => break,
                },
                Some(succeeded) = done_rx.recv() => {
                    self.stats.pending = self.stats.pending.saturating_sub(1);
                    if succeeded {
                        self.stats.completed += 1;
                    } else {
                        self.stats.failed += 1;
                    }
                }
            }
        }

        info!(
            "collector stopped ({} pending, {} completed, {} failed)",
            self.stats.pending, self.stats.completed, self.stats.failed
        );
    }

    /// Requests admitted before `stop` already hold a slot and were told
    /// `Ok`, so they still run and report.
    fn drain(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        done: &mpsc::UnboundedSender<bool>,
    ) {
        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Admit {
                    request,
                    permit,
                    ticket,
                } => {
                    self.stats.pending += 1;
                    self.spawn_fetch(request, permit, ticket, done.clone());
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats);
                }
            }
        }
    }

    fn spawn_fetch(
        &self,
        request: FetchRequest,
        permit: OwnedSemaphorePermit,
        ticket: Option<oneshot::Sender<Result<Torrent, FetchError>>>,
        done: mpsc::UnboundedSender<bool>,
    ) {
        let fetcher = self.fetcher.clone();
        let on_result = self.on_result.clone();

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(fetcher.fetch(request)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    warn!("fetch of {} from {} panicked", request.info_hash_hex(), request.addr);
                    Err(FetchError::Aborted)
                }
            };

            drop(permit);
            let _ = done.send(result.is_ok());

            if let Err(e) = &result {
                debug!(
                    "fetch of {} from {} failed: {}",
                    request.info_hash_hex(),
                    request.addr,
                    e
                );
            }
            on_result(&request, &result);

            if let Some(ticket) = ticket {
                let _ = ticket.send(result);
            }
        });
    }
}
