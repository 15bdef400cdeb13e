//! Per-task playback pipeline
//!
//! ```text
//! membership ─▶ fetch ─▶ voice acquire ─▶ playing ─▶ hold ─▶ finalize
//!     │            │           │                         │
//!     └─ failed ◀──┘           └─ error                  └─ completed | error
//! ```
//!
//! The destination was reserved by the caller. Finalization always runs:
//! it deletes the fetched file, releases the reservation and writes the
//! terminal status. A pipeline that took over a destination from a skipped
//! one does not touch the voice gateway until that one has released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vcmw_common::db::tasks::StatusDetail;
use vcmw_common::events::{PlaybackEndReason, WorkerEvent};
use vcmw_common::{Task, TaskStatus};

use super::guard::SessionLease;
use super::Orchestrator;
use crate::collaborators::{FetchError, FetchRequest, FetchedMedia, VoiceError};
use crate::notify;
use crate::{Error, Result};

/// Pause between join/replace attempts
const JOIN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How a pipeline ended, before it is written to the store
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// Never reached playback
    NotStarted(String),
    /// Voice session could not be acquired
    VoiceUnavailable(String),
    /// Played until the hold ended
    Played(PlaybackEndReason),
    /// Session broke after playback started
    Broken(String),
}

impl Outcome {
    fn status(&self) -> TaskStatus {
        match self {
            Outcome::NotStarted(_) => TaskStatus::Failed,
            Outcome::VoiceUnavailable(_) | Outcome::Broken(_) => TaskStatus::Error,
            Outcome::Played(_) => TaskStatus::Completed,
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            Outcome::NotStarted(d) | Outcome::VoiceUnavailable(d) | Outcome::Broken(d) => Some(d),
            Outcome::Played(_) => None,
        }
    }
}

const STOPPED_BEFORE_PLAYBACK: &str = "stopped before playback";

impl Orchestrator {
    /// Drive one claimed task to a terminal status
    ///
    /// Returns the terminal status written. `Err` only for Task Store
    /// failures, after local cleanup has run.
    pub(crate) async fn run_pipeline(&self, task: Task, lease: SessionLease) -> Result<TaskStatus> {
        let released = lease.release_on_drop();
        let mut fetched: Option<PathBuf> = None;
        let driven = self.drive(&task, &lease, &mut fetched).await;

        // Hand the destination on only after everything older is done with it
        lease.predecessor_released().await;

        // Local cleanup happens whether or not the store is reachable
        if let Some(path) = fetched.as_deref() {
            remove_media(path).await;
        }
        self.guard.release(&lease);
        drop(released);

        let outcome = driven?;
        self.finalize(&task, &outcome).await
    }

    async fn drive(
        &self,
        task: &Task,
        lease: &SessionLease,
        fetched: &mut Option<PathBuf>,
    ) -> Result<Outcome> {
        let destination = task.destination;

        // Step 1: membership
        if let Err(detail) = self.ensure_membership(task).await {
            return Ok(Outcome::NotStarted(detail));
        }
        if lease.is_ended() {
            return Ok(Outcome::NotStarted(STOPPED_BEFORE_PLAYBACK.to_string()));
        }

        // Step 2: fetch
        self.notifier.log(&notify::searching(&task.query, destination)).await;
        let media = match self.fetch(task).await {
            Ok(media) => media,
            Err(e) => return Ok(Outcome::NotStarted(format!("fetch failed: {}", e))),
        };
        *fetched = Some(media.path.clone());
        if lease.is_ended() {
            return Ok(Outcome::NotStarted(STOPPED_BEFORE_PLAYBACK.to_string()));
        }

        // Step 3: voice session
        tokio::select! {
            biased;
            _ = lease.ended() => return Ok(Outcome::NotStarted(STOPPED_BEFORE_PLAYBACK.to_string())),
            _ = lease.predecessor_released() => {}
        }
        let acquired = self.acquire_voice(lease, &media.path).await;
        if lease.is_ended() {
            if acquired.is_ok() {
                self.abandon_voice(lease).await;
            }
            return Ok(Outcome::NotStarted(STOPPED_BEFORE_PLAYBACK.to_string()));
        }
        if let Err(e) = acquired {
            return Ok(Outcome::VoiceUnavailable(format!("voice session unavailable: {}", e)));
        }

        // Step 4: playing
        if !self.guard.mark_playing(lease, &media.title, media.path.clone()) {
            self.abandon_voice(lease).await;
            return Ok(Outcome::NotStarted(STOPPED_BEFORE_PLAYBACK.to_string()));
        }

        let recorded = self
            .store
            .set_status(task.id, TaskStatus::Playing, Some(StatusDetail::Title(media.title.clone())))
            .await?;
        if !recorded {
            warn!(task_id = %task.id, "Task left processing unexpectedly; continuing playback");
        }

        info!(
            task_id = %task.id,
            destination = %destination,
            title = %media.title,
            requester = %task.requester,
            "Playback started"
        );
        self.events.emit_lossy(WorkerEvent::PlaybackStarted {
            task_id: task.id,
            destination,
            title: media.title.clone(),
            requester: task.requester.clone(),
            timestamp: chrono::Utc::now(),
        });

        let announcement = notify::now_playing(&media.title, &task.requester);
        self.notifier.announce(destination, &announcement).await;
        self.notifier.log(&announcement).await;

        // Step 5: hold
        match self.hold(lease, &media).await {
            Ok(reason) => {
                info!(task_id = %task.id, ?reason, "Playback ended");
                self.events.emit_lossy(WorkerEvent::PlaybackEnded {
                    task_id: task.id,
                    destination,
                    reason,
                    timestamp: chrono::Utc::now(),
                });
                Ok(Outcome::Played(reason))
            }
            Err(e) => Ok(Outcome::Broken(format!("playback interrupted: {}", e))),
        }
    }

    /// Membership step; `Err` carries the failure detail
    async fn ensure_membership(&self, task: &Task) -> std::result::Result<(), String> {
        let destination = task.destination;

        match self.bounded("is_member", self.chat.is_member(destination)).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(destination = %destination, "Not a member yet"),
            // Membership lookups fail for chats the account cannot see; try the invite
            Err(e) => debug!(destination = %destination, error = %e, "Membership check failed"),
        }

        let Some(invite) = task.invite.as_deref().filter(|i| !i.trim().is_empty()) else {
            return Err("cannot join destination: no invite".to_string());
        };

        self.bounded("join_by_invite", self.chat.join_by_invite(invite))
            .await
            .map_err(|e| format!("cannot join destination: {}", e))?;

        info!(destination = %destination, "Joined destination by invite");
        tokio::time::sleep(self.settings.settle_delay()).await;
        Ok(())
    }

    async fn fetch(&self, task: &Task) -> Result<FetchedMedia> {
        let request = FetchRequest {
            query: task.query.clone(),
            destination: task.destination,
            task_id: task.id,
        };
        let fetcher = Arc::clone(&self.fetcher);
        let limit = self.settings.fetch_timeout();

        let handle = tokio::task::spawn_blocking(move || fetcher.fetch(&request));
        let media = match tokio::time::timeout(limit, handle).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => return Err(Error::Internal(format!("fetch task panicked: {}", join_error))),
            Err(_) => return Err(Error::Timeout(format!("fetch after {:?}", limit))),
        };

        // Trust the disk, not the fetcher
        if !tokio::fs::try_exists(&media.path).await.unwrap_or(false) {
            return Err(FetchError::MissingFile(media.path).into());
        }
        Ok(media)
    }

    /// Join the destination's voice session or replace its stream
    ///
    /// Bounded by `worker.max_join_attempts`. A join refused because a
    /// session already exists switches to replace on the next attempt.
    async fn acquire_voice(&self, lease: &SessionLease, source: &Path) -> Result<()> {
        let destination = lease.destination();
        let attempts = self.settings.max_join_attempts.max(1);
        let mut replace = matches!(
            self.bounded("is_active", self.voice.is_active(destination)).await,
            Ok(true)
        );
        let mut last_error = None;

        for attempt in 1..=attempts {
            if lease.is_ended() {
                return Err(Error::InvalidState("session ended during voice acquisition".to_string()));
            }
            let result = if replace {
                self.bounded("replace_stream", self.voice.replace_stream(destination, source)).await
            } else {
                self.bounded("join", self.voice.join(destination, source)).await
            };

            match result {
                Ok(()) => {
                    debug!(destination = %destination, attempt, replace, "Voice stream started");
                    return Ok(());
                }
                Err(Error::Voice(VoiceError::AlreadyJoined(d))) => {
                    replace = true;
                    last_error = Some(Error::Voice(VoiceError::AlreadyJoined(d)));
                    continue;
                }
                Err(Error::Voice(VoiceError::NotJoined(d))) if replace => {
                    replace = false;
                    last_error = Some(Error::Voice(VoiceError::NotJoined(d)));
                    continue;
                }
                Err(e) => {
                    warn!(destination = %destination, attempt, error = %e, "Voice acquisition attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(JOIN_RETRY_BACKOFF).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::InvalidState("no voice attempt made".to_string())))
    }

    /// Undo a stream started after a stop or skip ended the lease
    ///
    /// The destination is still reserved by this lease (a stopped entry
    /// stays until released, a successor waits for the release), so the
    /// call cannot belong to anyone else yet. A skip's successor replaces
    /// the stream itself; only a stop needs the call gone.
    async fn abandon_voice(&self, lease: &SessionLease) {
        if lease.end_reason() == Some(PlaybackEndReason::Superseded) {
            return;
        }
        let destination = lease.destination();
        if let Err(e) = self.bounded("leave", self.voice.leave(destination)).await {
            debug!(destination = %destination, error = %e, "Leave after late stop failed");
        }
    }

    /// Wait until the stream ends, the session is ended from outside, or
    /// the hold window elapses
    async fn hold(&self, lease: &SessionLease, media: &FetchedMedia) -> Result<PlaybackEndReason> {
        let window = match media.duration {
            Some(length) => length + self.settings.hold_margin(),
            None => self.settings.fallback_hold(),
        };
        debug!(destination = %lease.destination(), ?window, "Holding session");

        tokio::select! {
            biased;
            _ = lease.ended() => Ok(lease.end_reason().unwrap_or(PlaybackEndReason::Stopped)),
            ended = self.voice.wait_stream_end(lease.destination()) => match ended {
                Ok(()) => Ok(PlaybackEndReason::StreamEnded),
                Err(e) => Err(e.into()),
            },
            _ = tokio::time::sleep(window) => Ok(PlaybackEndReason::HoldElapsed),
        }
    }

    async fn finalize(&self, task: &Task, outcome: &Outcome) -> Result<TaskStatus> {
        let status = outcome.status();
        let detail = outcome.detail().map(StatusDetail::error);

        let written = self.store.set_status(task.id, status, detail).await?;
        if !written {
            warn!(task_id = %task.id, %status, "Terminal status not applied; task already moved on");
        }

        match outcome {
            Outcome::Played(_) => {
                info!(task_id = %task.id, destination = %task.destination, "Task completed");
            }
            Outcome::NotStarted(detail) | Outcome::VoiceUnavailable(detail) | Outcome::Broken(detail) => {
                warn!(
                    task_id = %task.id,
                    destination = %task.destination,
                    %status,
                    "Task did not complete: {}",
                    detail
                );
                self.notifier
                    .log(&notify::not_played(&task.query, task.destination, detail))
                    .await;
            }
        }

        self.events.emit_lossy(WorkerEvent::TaskFinished {
            task_id: task.id,
            destination: task.destination,
            status,
            detail: outcome.detail().map(str::to_string),
            timestamp: chrono::Utc::now(),
        });
        Ok(status)
    }
}

async fn remove_media(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "Removed fetched media"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Could not remove fetched media"),
    }
}
