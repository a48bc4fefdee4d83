//! Core relay pipeline split into focused submodules.
//!
//! The `MediaRelay` struct and its methods are organized by domain:
//! - [`dispatch`] - Single-relay admission and the server-side fast path
//! - [`download`] - Download worker pool (fetch + spool)
//! - [`upload`] - Upload worker pool (framing, delivery, progress)
//! - [`batch`] - Batch orchestration state machine and sessions
//! - [`entity_cache`] - Per-requester dialog cache with single-flight loads
//! - [`control`] - Admin surface (grants, depths, drains, cleanup)

mod batch;
mod control;
mod dispatch;
mod download;
mod entity_cache;
mod upload;

pub use batch::BatchStep;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::access::AccessController;
use crate::backoff::FloodPolicy;
use crate::client::MessengerClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::GrantStore;
use crate::types::{DownloadTask, Event, RequesterId, UploadJob};
use batch::BatchSession;
use entity_cache::EntityCache;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for workers to wind down before proceeding
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Completion confirmation for a single relay, shared by the fast copy path
/// and the pipeline path so both read identically to the requester.
pub(crate) const SINGLE_DONE_NOTICE: &str = "✅ Media delivered.";

/// Task and send queue state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Admitted tasks waiting for a download worker (FIFO)
    pub(crate) tasks: Arc<Mutex<VecDeque<DownloadTask>>>,
    /// Spooled jobs waiting for an upload worker (FIFO per requester)
    pub(crate) jobs: Arc<Mutex<VecDeque<UploadJob>>>,
    /// Flag cleared during shutdown so no new relays are admitted
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Monotonic task id source
    pub(crate) next_task_id: Arc<AtomicU64>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(VecDeque::new())),
            jobs: Arc::new(Mutex::new(VecDeque::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            next_task_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Per-requester session state shared between the pools and the orchestrator
#[derive(Clone)]
pub(crate) struct SessionState {
    /// Live batch sessions, at most one per requester
    pub(crate) batches: Arc<Mutex<HashMap<RequesterId, BatchSession>>>,
    /// Keyed delivery locks serializing uploads per requester
    pub(crate) delivery_locks: Arc<Mutex<HashMap<RequesterId, Arc<Mutex<()>>>>>,
    /// Progress notice ids, one per requester, edited in place
    pub(crate) progress: Arc<Mutex<HashMap<RequesterId, crate::types::MessageId>>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            batches: Arc::new(Mutex::new(HashMap::new())),
            delivery_locks: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Main relay instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct MediaRelay {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Messenger transport (trait object for pluggable implementations)
    pub(crate) client: Arc<dyn MessengerClient>,
    /// Admission gate and token economy
    pub(crate) access: Arc<AccessController>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Task and send queue state
    pub(crate) queues: QueueState,
    /// Batch sessions, delivery locks, and progress notices
    pub(crate) sessions: SessionState,
    /// Per-requester dialog cache
    pub(crate) entities: Arc<EntityCache>,
    /// Rate-limit pause policy shared by both pools
    pub(crate) flood: FloodPolicy,
    /// Root cancellation token stopping workers between jobs
    pub(crate) cancel: CancellationToken,
    /// Handles of spawned workers, awaited during shutdown
    pub(crate) workers: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl MediaRelay {
    /// Create a new MediaRelay instance
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Creates the spool directory
    /// - Loads persisted grants and pins the admin entry
    /// - Sets up the event broadcast channel
    ///
    /// Workers are not running yet; call [`start`](Self::start) to spawn the
    /// pools and the grant purge loop.
    pub async fn new(
        config: Config,
        client: Arc<dyn MessengerClient>,
        store: Arc<dyn GrantStore>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(config.spool_dir())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create spool directory '{}': {}",
                        config.spool_dir().display(),
                        e
                    ),
                ))
            })?;

        let access = Arc::new(AccessController::open(&config.access, store).await?);

        // Buffer of 1000 events so multiple subscribers can follow independently
        let (event_tx, _rx) = broadcast::channel(1000);

        let flood = FloodPolicy::new(&config.flood);

        Ok(Self {
            config: Arc::new(config),
            client,
            access,
            event_tx,
            queues: QueueState::new(),
            sessions: SessionState::new(),
            entities: Arc::new(EntityCache::new()),
            flood,
            cancel: CancellationToken::new(),
            workers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Spawn the download pool, the upload pool, and the grant purge loop.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        for worker in 0..self.config.pipeline.download_workers {
            workers.push(self.spawn_download_worker(worker));
        }
        for worker in 0..self.config.pipeline.upload_workers {
            workers.push(self.spawn_upload_worker(worker));
        }
        workers.push(
            self.access
                .spawn_purge_loop(self.config.access.purge_interval, self.cancel.clone()),
        );

        info!(
            download_workers = self.config.pipeline.download_workers,
            upload_workers = self.config.pipeline.upload_workers,
            "Relay pipeline started"
        );
    }

    /// Subscribe to relay events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events
    /// independently. Events are buffered, but a subscriber that falls behind
    /// by more than 1000 events receives a `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Gracefully shut down the relay
    ///
    /// Stops admitting new relays, cancels the worker pools (in-flight
    /// deliveries finish), waits for them to wind down with a timeout, and
    /// emits a final Shutdown event. Queued-but-unstarted work is discarded;
    /// queues are volatile by design.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        self.queues.accepting_new.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        let worker_count = handles.len();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles)).await {
            Ok(_) => info!(worker_count, "All workers stopped"),
            Err(_) => warn!(
                worker_count,
                "Timeout waiting for workers to stop, proceeding with shutdown"
            ),
        }

        self.emit_event(Event::Shutdown);
        info!("Graceful shutdown complete");
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// relaying continues even when no one is listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Mint the next task id.
    pub(crate) fn next_task_id(&self) -> crate::types::TaskId {
        crate::types::TaskId(self.queues.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The delivery lock for one requester, created on first use.
    pub(crate) async fn delivery_lock_for(&self, requester: RequesterId) -> Arc<Mutex<()>> {
        let mut locks = self.sessions.delivery_locks.lock().await;
        locks
            .entry(requester)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Await a pipeline call under an optional deadline; a zero limit disables
/// the deadline. Timing out maps to a transfer failure so the call follows
/// its stage's failure policy.
pub(crate) async fn with_deadline<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::TransferFailed(format!(
            "{what} timed out after {}s",
            limit.as_secs()
        ))),
    }
}
