//! Playback orchestrator
//!
//! **Responsibilities:**
//! - Poll the Task Store and claim the oldest task whose destination is idle
//! - Reserve the destination in the [`SessionGuard`] before any side effect
//! - Run one pipeline per claimed task (see [`pipeline`])
//! - Apply manual controls (see [`controls`])
//!
//! **Concurrency:** Pipelines for different destinations run in parallel,
//! bounded by `worker.max_concurrent_pipelines`. Pipelines for the same
//! destination never overlap.
//!
//! **Failure policy:** Collaborator failures end the task they occurred in.
//! A Task Store failure ends the poll loop: [`Orchestrator::run`] returns
//! the error and the binary exits non-zero.

pub mod controls;
pub mod guard;
pub mod pipeline;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vcmw_common::config::WorkerConfig;
use vcmw_common::events::{EventBus, PlaybackEndReason, WorkerEvent};
use vcmw_common::{DestinationId, Task, TaskId, TaskStatus, TaskStore};

use crate::collaborators::{ChatTransport, MediaFetcher, VoiceGateway};
use crate::notify::Notifier;
use crate::{Error, Result};

pub use controls::ControlOutcome;
pub use guard::{SessionGuard, SessionLease, SessionPhase, SessionSnapshot};

/// Event bus capacity for orchestrator events
const EVENT_CAPACITY: usize = 256;

/// The three external seams the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub chat: Arc<dyn ChatTransport>,
    pub voice: Arc<dyn VoiceGateway>,
    pub fetcher: Arc<dyn MediaFetcher>,
}

/// Result of one claim attempt
enum Claim {
    Ready(Task, SessionLease),
    /// Claimed, but its destination was taken between the busy snapshot
    /// and the reservation; held for a later tick
    Deferred,
    Idle,
}

/// Poll loop, session guard and controls over a shared Task Store
pub struct Orchestrator {
    store: TaskStore,
    chat: Arc<dyn ChatTransport>,
    voice: Arc<dyn VoiceGateway>,
    fetcher: Arc<dyn MediaFetcher>,
    guard: SessionGuard,
    notifier: Notifier,
    events: EventBus,
    settings: WorkerConfig,
    /// Worker slots; one permit per running pipeline
    slots: Arc<Semaphore>,
    /// Claimed tasks (status `processing`) waiting for their destination
    deferred: Mutex<VecDeque<Task>>,
    /// Spawned pipelines, drained at shutdown
    pipelines: TaskTracker,
    /// Store failures raised inside spawned pipelines
    fatal_tx: mpsc::UnboundedSender<Error>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: TaskStore,
        collaborators: Collaborators,
        settings: WorkerConfig,
        log_chat: Option<DestinationId>,
    ) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(
            Arc::clone(&collaborators.chat),
            log_chat,
            settings.collaborator_timeout(),
        );

        Arc::new(Self {
            store,
            chat: collaborators.chat,
            voice: collaborators.voice,
            fetcher: collaborators.fetcher,
            guard: SessionGuard::new(),
            notifier,
            events: EventBus::new(EVENT_CAPACITY),
            slots: Arc::new(Semaphore::new(settings.max_concurrent_pipelines.max(1))),
            settings,
            deferred: Mutex::new(VecDeque::new()),
            pipelines: TaskTracker::new(),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn settings(&self) -> &WorkerConfig {
        &self.settings
    }

    pub fn session(&self, destination: DestinationId) -> Option<SessionSnapshot> {
        self.guard.snapshot(destination)
    }

    pub fn active_sessions(&self) -> usize {
        self.guard.active_count()
    }

    /// Token that stops the poll loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("Orchestrator shutdown requested");
        self.shutdown.cancel();
    }

    /// Poll loop
    ///
    /// Runs until [`Orchestrator::shutdown`] is called (returns `Ok`) or the
    /// Task Store fails (returns the error). Can only be started once.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::InvalidState("poll loop already started".to_string()))?;

        info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            max_pipelines = self.settings.max_concurrent_pipelines,
            "Poll loop started"
        );

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break Ok(());
            }
            if let Ok(e) = fatal_rx.try_recv() {
                break Err(e);
            }

            // Wait for a free worker slot before claiming anything
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(e) = fatal_rx.recv() => break Err(e),
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(Error::InvalidState("worker slots closed".to_string())),
                },
            };

            match self.next_claim().await {
                Ok(Claim::Ready(task, lease)) => {
                    self.spawn_pipeline(task, lease, Some(permit));
                }
                Ok(Claim::Deferred) => {}
                Ok(Claim::Idle) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break Ok(()),
                        Some(e) = fatal_rx.recv() => break Err(e),
                        _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match &outcome {
            Ok(()) => info!("Poll loop stopped"),
            Err(e) => {
                error!("Poll loop halted: {}", e);
                // Take the HTTP surface down with us
                self.shutdown.cancel();
            }
        }
        outcome
    }

    /// Claim one task and run its pipeline to completion on this task
    ///
    /// Returns the claimed task and its final status, or `None` when nothing
    /// was claimable. Useful for single-shot runs and tests.
    pub async fn run_once(self: &Arc<Self>) -> Result<Option<(TaskId, TaskStatus)>> {
        loop {
            match self.next_claim().await? {
                Claim::Ready(task, lease) => {
                    let task_id = task.id;
                    let status = self.run_pipeline(task, lease).await?;
                    return Ok(Some((task_id, status)));
                }
                Claim::Deferred => continue,
                Claim::Idle => return Ok(None),
            }
        }
    }

    async fn next_claim(&self) -> Result<Claim> {
        // Deferred tasks were claimed first, so they go first
        if let Some(task) = self.take_ready_deferred(None) {
            return Ok(self.reserve(task));
        }

        let mut excluded = self.guard.busy_destinations();
        excluded.extend(self.deferred_destinations());

        let Some(task) = self.store.claim_next_excluding(&excluded).await? else {
            return Ok(Claim::Idle);
        };

        info!(
            task_id = %task.id,
            destination = %task.destination,
            requester = %task.requester,
            "Claimed task"
        );
        self.events.emit_lossy(WorkerEvent::TaskClaimed {
            task_id: task.id,
            destination: task.destination,
            timestamp: chrono::Utc::now(),
        });

        Ok(self.reserve(task))
    }

    fn reserve(&self, task: Task) -> Claim {
        match self.guard.try_acquire(task.destination, task.id, &task.requester) {
            Some(lease) => Claim::Ready(task, lease),
            None => {
                debug!(
                    task_id = %task.id,
                    destination = %task.destination,
                    "Destination busy, deferring claimed task"
                );
                self.events.emit_lossy(WorkerEvent::TaskDeferred {
                    task_id: task.id,
                    destination: task.destination,
                    timestamp: chrono::Utc::now(),
                });
                self.lock_deferred().push_back(task);
                Claim::Deferred
            }
        }
    }

    fn lock_deferred(&self) -> std::sync::MutexGuard<'_, VecDeque<Task>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deferred_destinations(&self) -> Vec<DestinationId> {
        self.lock_deferred().iter().map(|t| t.destination).collect()
    }

    /// Oldest deferred task whose destination is free (or for `destination`)
    pub(crate) fn take_ready_deferred(&self, destination: Option<DestinationId>) -> Option<Task> {
        let mut deferred = self.lock_deferred();
        let position = deferred.iter().position(|t| match destination {
            Some(d) => t.destination == d,
            None => !self.guard.is_occupied(t.destination),
        })?;
        deferred.remove(position)
    }

    pub(crate) fn spawn_pipeline(
        self: &Arc<Self>,
        task: Task,
        lease: SessionLease,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        self.pipelines.spawn(async move {
            let _permit = permit;
            let task_id = task.id;
            if let Err(e) = orchestrator.run_pipeline(task, lease).await {
                error!(task_id = %task_id, "Pipeline aborted by store failure: {}", e);
                let _ = orchestrator.fatal_tx.send(e);
            }
        })
    }

    /// Try to take a worker slot without waiting
    pub(crate) fn try_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Bound a collaborator call by the advisory timeout
    pub(crate) async fn bounded<T, E, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        let limit = self.settings.collaborator_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                warn!(operation, ?limit, "Collaborator call timed out");
                Err(Error::Timeout(format!("{} after {:?}", operation, limit)))
            }
        }
    }

    /// End every active session and stop the poll loop
    pub fn stop_all(&self) {
        self.shutdown();
        let ended = self.guard.clear_all(PlaybackEndReason::Stopped);
        if ended > 0 {
            info!("Ended {} active session(s) for shutdown", ended);
        }
    }

    /// Wait for spawned pipelines to write their final status
    ///
    /// Call after [`Orchestrator::stop_all`]. Returns `false` when some were
    /// still running after `grace`; those tasks are left to startup recovery.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.pipelines.close();
        let drained = tokio::time::timeout(grace, self.pipelines.wait()).await.is_ok();
        if drained {
            debug!("All pipelines finished");
        } else {
            warn!(remaining = self.pipelines.len(), ?grace, "Pipelines still running at shutdown");
        }
        drained
    }
}
