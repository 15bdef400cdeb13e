//! Event types for the VCMW event system
//!
//! The orchestrator publishes [`WorkerEvent`]s on an [`EventBus`] as tasks move
//! through the pipeline and as manual controls are applied. Subscribers are
//! optional: nothing in the worker depends on an event being received.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::models::{DestinationId, TaskId, TaskStatus};

/// Why a playback window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// The voice gateway signalled end of stream
    StreamEnded,
    /// The bounded hold window elapsed
    HoldElapsed,
    /// A stop control ended the session
    Stopped,
    /// A skip started the next task in the same destination
    Superseded,
}

/// Manual control applied to a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Stop,
    Skip,
    Pause,
    Resume,
}

/// Worker event types
///
/// Serialized with a `type` tag so they can be forwarded as JSON as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// A task was claimed and its destination reserved
    TaskClaimed {
        task_id: TaskId,
        destination: DestinationId,
        timestamp: DateTime<Utc>,
    },

    /// A claimed task could not reserve its destination and waits for a later tick
    TaskDeferred {
        task_id: TaskId,
        destination: DestinationId,
        timestamp: DateTime<Utc>,
    },

    /// Audio is streaming into the destination's voice session
    PlaybackStarted {
        task_id: TaskId,
        destination: DestinationId,
        title: String,
        requester: String,
        timestamp: DateTime<Utc>,
    },

    /// The playback window of a task closed
    PlaybackEnded {
        task_id: TaskId,
        destination: DestinationId,
        reason: PlaybackEndReason,
        timestamp: DateTime<Utc>,
    },

    /// A task reached its final status for this worker
    TaskFinished {
        task_id: TaskId,
        destination: DestinationId,
        status: TaskStatus,
        detail: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A manual control was applied
    ControlApplied {
        destination: DestinationId,
        action: ControlAction,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerEvent {
    /// Destination the event concerns
    pub fn destination(&self) -> DestinationId {
        match self {
            WorkerEvent::TaskClaimed { destination, .. }
            | WorkerEvent::TaskDeferred { destination, .. }
            | WorkerEvent::PlaybackStarted { destination, .. }
            | WorkerEvent::PlaybackEnded { destination, .. }
            | WorkerEvent::TaskFinished { destination, .. }
            | WorkerEvent::ControlApplied { destination, .. } => *destination,
        }
    }

    /// Task the event concerns; controls are not tied to a task
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            WorkerEvent::TaskClaimed { task_id, .. }
            | WorkerEvent::TaskDeferred { task_id, .. }
            | WorkerEvent::PlaybackStarted { task_id, .. }
            | WorkerEvent::PlaybackEnded { task_id, .. }
            | WorkerEvent::TaskFinished { task_id, .. } => Some(*task_id),
            WorkerEvent::ControlApplied { .. } => None,
        }
    }
}

/// Broadcast bus for [`WorkerEvent`]s
///
/// # Examples
///
/// ```
/// use vcmw_common::events::{ControlAction, EventBus, WorkerEvent};
/// use vcmw_common::DestinationId;
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
/// bus.emit_lossy(WorkerEvent::ControlApplied {
///     destination: DestinationId(555),
///     action: ControlAction::Stop,
///     timestamp: chrono::Utc::now(),
/// });
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: WorkerEvent,
    ) -> Result<usize, broadcast::error::SendError<WorkerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
