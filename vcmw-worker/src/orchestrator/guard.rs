//! Per-destination session guard
//!
//! **Responsibilities:**
//! - At most one pipeline owns a destination at any instant
//! - Reserve a destination atomically at claim time (check-and-insert)
//! - Let stop/skip end the owning pipeline through its cancellation token
//! - Answer "what is playing in X" for controls and the HTTP API
//!
//! An ended entry stays in the map until its pipeline releases it, so the
//! destination is not handed out while that pipeline may still be talking
//! to the voice gateway. A superseding lease carries the ended owner's
//! release signal and waits on it before touching the gateway.
//!
//! All operations hold a single mutex for the duration of a map update and
//! never across an `.await`.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio_util::sync::{CancellationToken, DropGuard};
use vcmw_common::events::PlaybackEndReason;
use vcmw_common::{DestinationId, TaskId};

/// Session lifecycle as seen by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Reserved; membership/fetch/voice acquisition in progress
    Preparing,
    Playing,
    Paused,
}

/// Cancellation handle shared between the guard entry and its pipeline
#[derive(Debug, Default)]
struct EndSignal {
    token: CancellationToken,
    reason: OnceLock<PlaybackEndReason>,
    /// Cancelled once the owning pipeline is done with the gateway
    released: CancellationToken,
}

impl EndSignal {
    fn end(&self, reason: PlaybackEndReason) {
        // First reason wins
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    fn is_ended(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A pipeline's claim on a destination
///
/// Dropping a lease does not release the destination; the pipeline releases
/// it explicitly at finalization through [`SessionGuard::release`].
#[derive(Debug, Clone)]
pub struct SessionLease {
    destination: DestinationId,
    task_id: TaskId,
    signal: Arc<EndSignal>,
    /// Release signal of the session this lease superseded
    predecessor: Option<CancellationToken>,
}

impl SessionLease {
    pub fn destination(&self) -> DestinationId {
        self.destination
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_ended(&self) -> bool {
        self.signal.token.is_cancelled()
    }

    /// Resolves once stop or skip ended this session
    pub async fn ended(&self) {
        self.signal.token.cancelled().await
    }

    /// Why the session was ended from outside, if it was
    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        self.signal.reason.get().copied()
    }

    /// Resolves once the superseded pipeline has let go of the destination
    ///
    /// Immediate for leases that did not supersede anything.
    pub async fn predecessor_released(&self) {
        if let Some(released) = &self.predecessor {
            released.cancelled().await
        }
    }

    /// Signals successors when dropped, including on unwind
    pub fn release_on_drop(&self) -> DropGuard {
        self.signal.released.clone().drop_guard()
    }
}

#[derive(Debug)]
struct DestinationSession {
    task_id: TaskId,
    requester: String,
    phase: SessionPhase,
    title: Option<String>,
    file: Option<PathBuf>,
    signal: Arc<EndSignal>,
}

impl DestinationSession {
    fn new(task_id: TaskId, requester: &str) -> Self {
        Self {
            task_id,
            requester: requester.to_string(),
            phase: SessionPhase::Preparing,
            title: None,
            file: None,
            signal: Arc::new(EndSignal::default()),
        }
    }

    fn lease(&self, destination: DestinationId, predecessor: Option<CancellationToken>) -> SessionLease {
        SessionLease {
            destination,
            task_id: self.task_id,
            signal: Arc::clone(&self.signal),
            predecessor,
        }
    }

    fn snapshot(&self, destination: DestinationId) -> SessionSnapshot {
        SessionSnapshot {
            destination,
            task_id: self.task_id,
            requester: self.requester.clone(),
            state: self.phase,
            title: self.title.clone(),
            file: self.file.clone(),
        }
    }
}

/// Read-only view of one destination's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub destination: DestinationId,
    pub task_id: TaskId,
    pub requester: String,
    pub state: SessionPhase,
    pub title: Option<String>,
    pub file: Option<PathBuf>,
}

/// Destination → active session map
#[derive(Debug, Default)]
pub struct SessionGuard {
    sessions: Mutex<HashMap<DestinationId, DestinationSession>>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DestinationId, DestinationSession>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `destination` for `task_id`
    ///
    /// Returns `None` when another task owns the destination, including an
    /// ended task whose pipeline has not released it yet.
    pub fn try_acquire(
        &self,
        destination: DestinationId,
        task_id: TaskId,
        requester: &str,
    ) -> Option<SessionLease> {
        let mut sessions = self.lock();
        if sessions.contains_key(&destination) {
            return None;
        }
        let session = DestinationSession::new(task_id, requester);
        let lease = session.lease(destination, None);
        sessions.insert(destination, session);
        Some(lease)
    }

    /// Hand `destination` to `task_id`, ending whatever owned it
    ///
    /// Returns the new lease and the superseded task, if any. The new lease
    /// must wait for [`SessionLease::predecessor_released`] before using
    /// the voice gateway.
    pub fn supersede(
        &self,
        destination: DestinationId,
        task_id: TaskId,
        requester: &str,
    ) -> (SessionLease, Option<TaskId>) {
        let mut sessions = self.lock();
        let previous = sessions.remove(&destination);

        let predecessor = previous.as_ref().map(|old| old.signal.released.clone());
        let session = DestinationSession::new(task_id, requester);
        let lease = session.lease(destination, predecessor);
        sessions.insert(destination, session);
        drop(sessions);

        let superseded = previous.and_then(|old| {
            let was_live = !old.signal.is_ended();
            old.signal.end(PlaybackEndReason::Superseded);
            was_live.then_some(old.task_id)
        });
        (lease, superseded)
    }

    /// Record that the lease's stream is now live
    ///
    /// Returns `false` if the lease no longer owns the destination (a stop
    /// or skip got there first).
    pub fn mark_playing(&self, lease: &SessionLease, title: &str, file: PathBuf) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(&lease.destination) {
            Some(session) if session.task_id == lease.task_id && !lease.is_ended() => {
                session.phase = SessionPhase::Playing;
                session.title = Some(title.to_string());
                session.file = Some(file);
                true
            }
            _ => false,
        }
    }

    /// Flip the paused flag of a playing session
    ///
    /// Returns `false` when nothing is playing in `destination`.
    pub fn set_paused(&self, destination: DestinationId, paused: bool) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(&destination) {
            Some(session) if session.phase != SessionPhase::Preparing && !session.signal.is_ended() => {
                session.phase = if paused {
                    SessionPhase::Paused
                } else {
                    SessionPhase::Playing
                };
                true
            }
            _ => false,
        }
    }

    /// Drop the lease's entry if it still owns the destination
    ///
    /// Safe to call more than once and after a skip replaced it. This is the
    /// only way an entry leaves the map outside shutdown.
    pub fn release(&self, lease: &SessionLease) -> bool {
        let mut sessions = self.lock();
        let owned = sessions
            .get(&lease.destination)
            .is_some_and(|s| s.task_id == lease.task_id);
        if owned {
            sessions.remove(&lease.destination);
        }
        owned
    }

    /// End whatever owns `destination` with `reason`
    ///
    /// The entry stays occupied until its pipeline calls
    /// [`SessionGuard::release`]. Returns the task that was ended; `None`
    /// means nothing live was there.
    pub fn clear(&self, destination: DestinationId, reason: PlaybackEndReason) -> Option<TaskId> {
        let sessions = self.lock();
        let session = sessions.get(&destination)?;
        if session.signal.is_ended() {
            return None;
        }
        session.signal.end(reason);
        Some(session.task_id)
    }

    /// End every live session (shutdown)
    pub fn clear_all(&self, reason: PlaybackEndReason) -> usize {
        let sessions = self.lock();
        let live: Vec<_> = sessions.values().filter(|s| !s.signal.is_ended()).collect();
        for session in &live {
            session.signal.end(reason);
        }
        live.len()
    }

    /// Whether any entry, live or ended, holds `destination`
    pub fn is_occupied(&self, destination: DestinationId) -> bool {
        self.lock().contains_key(&destination)
    }

    pub fn busy_destinations(&self) -> Vec<DestinationId> {
        self.lock().keys().copied().collect()
    }

    /// Sessions not yet ended by a control
    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|s| !s.signal.is_ended()).count()
    }

    pub fn snapshot(&self, destination: DestinationId) -> Option<SessionSnapshot> {
        self.lock()
            .get(&destination)
            .filter(|s| !s.signal.is_ended())
            .map(|s| s.snapshot(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    const DEST: DestinationId = DestinationId(555);

    #[test]
    fn test_second_acquire_is_refused() {
        let guard = SessionGuard::new();
        let first = guard.try_acquire(DEST, Uuid::new_v4(), "alice");
        assert!(first.is_some());
        assert!(guard.try_acquire(DEST, Uuid::new_v4(), "bob").is_none());
        assert!(guard.try_acquire(DestinationId(1), Uuid::new_v4(), "bob").is_some());
        assert_eq!(guard.active_count(), 2);
    }

    #[test]
    fn test_release_is_owner_only_and_idempotent() {
        let guard = SessionGuard::new();
        let lease = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();

        assert!(guard.release(&lease));
        assert!(!guard.release(&lease));
        assert!(!guard.is_occupied(DEST));

        // A stale lease must not evict the new owner
        let fresh = guard.try_acquire(DEST, Uuid::new_v4(), "bob").unwrap();
        assert!(!guard.release(&lease));
        assert_eq!(guard.snapshot(DEST).unwrap().task_id, fresh.task_id());
    }

    #[test]
    fn test_mark_playing_and_pause() {
        let guard = SessionGuard::new();
        let lease = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();

        // Nothing to pause while preparing
        assert!(!guard.set_paused(DEST, true));

        assert!(guard.mark_playing(&lease, "Song A", PathBuf::from("/tmp/a.m4a")));
        let snap = guard.snapshot(DEST).unwrap();
        assert_eq!(snap.state, SessionPhase::Playing);
        assert_eq!(snap.title.as_deref(), Some("Song A"));

        assert!(guard.set_paused(DEST, true));
        assert_eq!(guard.snapshot(DEST).unwrap().state, SessionPhase::Paused);
        assert!(guard.set_paused(DEST, false));
        assert_eq!(guard.snapshot(DEST).unwrap().state, SessionPhase::Playing);
    }

    #[test]
    fn test_clear_ends_lease_with_reason() {
        let guard = SessionGuard::new();
        let lease = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();

        assert_eq!(guard.clear(DEST, PlaybackEndReason::Stopped), Some(lease.task_id()));
        assert!(lease.is_ended());
        assert_eq!(lease.end_reason(), Some(PlaybackEndReason::Stopped));
        assert!(!guard.mark_playing(&lease, "late", PathBuf::from("/tmp/x")));

        // Clearing again is a no-op
        assert_eq!(guard.clear(DEST, PlaybackEndReason::Stopped), None);
    }

    #[test]
    fn test_cleared_destination_stays_busy_until_release() {
        let guard = SessionGuard::new();
        let lease = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();
        guard.clear(DEST, PlaybackEndReason::Stopped);

        // Ended but not released: hidden from readers, still reserved
        assert!(guard.snapshot(DEST).is_none());
        assert_eq!(guard.active_count(), 0);
        assert!(!guard.set_paused(DEST, true));
        assert_eq!(guard.busy_destinations(), vec![DEST]);
        assert!(guard.try_acquire(DEST, Uuid::new_v4(), "bob").is_none());

        assert!(guard.release(&lease));
        assert!(guard.try_acquire(DEST, Uuid::new_v4(), "bob").is_some());
    }

    #[tokio::test]
    async fn test_successor_waits_for_superseded_release() {
        let guard = SessionGuard::new();
        let old = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();
        let (new, _) = guard.supersede(DEST, Uuid::new_v4(), "bob");

        let waiting = tokio::time::timeout(Duration::from_millis(50), new.predecessor_released()).await;
        assert!(waiting.is_err());

        drop(old.release_on_drop());
        tokio::time::timeout(Duration::from_secs(1), new.predecessor_released())
            .await
            .expect("released");

        // A fresh acquisition has nothing to wait for
        let other = guard.try_acquire(DestinationId(1), Uuid::new_v4(), "carol").unwrap();
        other.predecessor_released().await;
    }

    #[test]
    fn test_supersede_after_stop_reports_nothing_superseded() {
        let guard = SessionGuard::new();
        let old = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();
        guard.clear(DEST, PlaybackEndReason::Stopped);

        let (_new, superseded) = guard.supersede(DEST, Uuid::new_v4(), "bob");
        assert_eq!(superseded, None);
        assert_eq!(old.end_reason(), Some(PlaybackEndReason::Stopped));
    }

    #[test]
    fn test_supersede_swaps_owner_atomically() {
        let guard = SessionGuard::new();
        let old = guard.try_acquire(DEST, Uuid::new_v4(), "alice").unwrap();
        let next_id = Uuid::new_v4();

        let (new, superseded) = guard.supersede(DEST, next_id, "bob");
        assert_eq!(superseded, Some(old.task_id()));
        assert_eq!(old.end_reason(), Some(PlaybackEndReason::Superseded));
        assert!(!new.is_ended());
        assert_eq!(guard.snapshot(DEST).unwrap().task_id, next_id);

        // Old pipeline's finalization leaves the new owner in place
        assert!(!guard.release(&old));
        assert!(guard.is_occupied(DEST));
    }

    #[test]
    fn test_supersede_on_idle_destination() {
        let guard = SessionGuard::new();
        let (_lease, superseded) = guard.supersede(DEST, Uuid::new_v4(), "bob");
        assert_eq!(superseded, None);
        assert_eq!(guard.busy_destinations(), vec![DEST]);
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let guard = Arc::new(SessionGuard::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_acquire(DEST, Uuid::new_v4(), "x").is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
