//! Manual controls: stop, skip, pause, resume, join
//!
//! Controls act on one destination and run concurrently with pipelines. They
//! only touch the session guard through its atomic operations, so a control
//! racing a pipeline's finalization cannot corrupt the destination's entry.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use vcmw_common::events::{ControlAction, PlaybackEndReason, WorkerEvent};
use vcmw_common::{DestinationId, TaskId};

use super::Orchestrator;
use crate::collaborators::VoiceError;
use crate::{Error, Result};

/// What a control did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    /// Session ended; `task_id` is `None` when nothing was active
    Stopped { task_id: Option<TaskId> },
    /// Next pending task for the destination started
    Skipped {
        next_task_id: TaskId,
        superseded: Option<TaskId>,
    },
    Paused,
    Resumed,
    /// Nothing is playing in the destination
    NoSession,
    Joined,
}

impl Orchestrator {
    fn control_applied(&self, destination: DestinationId, action: ControlAction) {
        self.events.emit_lossy(WorkerEvent::ControlApplied {
            destination,
            action,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Leave the destination's voice session and end its pipeline
    ///
    /// Idempotent: with no active session this still asks the gateway to
    /// leave (the worker may linger in a finished call) and succeeds when
    /// the gateway reports nothing to leave.
    ///
    /// The destination stays reserved until the stopped pipeline exits.
    pub async fn stop(&self, destination: DestinationId) -> Result<ControlOutcome> {
        let ended = self.guard.clear(destination, PlaybackEndReason::Stopped);

        match self.bounded("leave", self.voice.leave(destination)).await {
            Ok(()) | Err(Error::Voice(VoiceError::NotJoined(_))) => {}
            Err(e) => {
                warn!(destination = %destination, error = %e, "Leave failed during stop");
                return Err(e);
            }
        }

        info!(destination = %destination, task_id = ?ended, "Stopped");
        self.control_applied(destination, ControlAction::Stop);
        Ok(ControlOutcome::Stopped { task_id: ended })
    }

    /// Start the next pending task for `destination` now, ending the current one
    ///
    /// With nothing pending this behaves like [`Orchestrator::stop`].
    /// The next task fetches right away but holds off the voice gateway
    /// until the current pipeline has let go of the destination.
    pub async fn skip(self: &Arc<Self>, destination: DestinationId) -> Result<ControlOutcome> {
        let next = match self.take_ready_deferred(Some(destination)) {
            Some(task) => Some(task),
            None => self.store.claim_next_for(destination).await?,
        };

        let Some(task) = next else {
            info!(destination = %destination, "Skip with empty queue, stopping instead");
            return self.stop(destination).await;
        };

        let (lease, superseded) = self.guard.supersede(destination, task.id, &task.requester);
        info!(
            destination = %destination,
            next_task_id = %task.id,
            superseded = ?superseded,
            "Skipping to next task"
        );
        let next_task_id = task.id;
        self.spawn_pipeline(task, lease, self.try_slot());

        self.control_applied(destination, ControlAction::Skip);
        Ok(ControlOutcome::Skipped {
            next_task_id,
            superseded,
        })
    }

    pub async fn pause(&self, destination: DestinationId) -> Result<ControlOutcome> {
        match self.bounded("pause", self.voice.pause(destination)).await {
            Ok(()) => {
                self.guard.set_paused(destination, true);
                self.control_applied(destination, ControlAction::Pause);
                Ok(ControlOutcome::Paused)
            }
            Err(Error::Voice(VoiceError::NotJoined(_))) => Ok(ControlOutcome::NoSession),
            Err(e) => Err(e),
        }
    }

    pub async fn resume(&self, destination: DestinationId) -> Result<ControlOutcome> {
        match self.bounded("resume", self.voice.resume(destination)).await {
            Ok(()) => {
                self.guard.set_paused(destination, false);
                self.control_applied(destination, ControlAction::Resume);
                Ok(ControlOutcome::Resumed)
            }
            Err(Error::Voice(VoiceError::NotJoined(_))) => Ok(ControlOutcome::NoSession),
            Err(e) => Err(e),
        }
    }

    /// Join a destination by invite ahead of any task for it
    pub async fn join(&self, invite: &str) -> Result<ControlOutcome> {
        let invite = invite.trim();
        if invite.is_empty() {
            return Err(Error::InvalidInput("invite must not be empty".to_string()));
        }
        self.bounded("join_by_invite", self.chat.join_by_invite(invite)).await?;
        info!(invite = %invite, "Joined by invite");
        self.notifier.log(&format!("Joined {}", invite)).await;
        Ok(ControlOutcome::Joined)
    }
}
