//! Database models
//!
//! A [`Task`] is one queued playback request. Its [`TaskStatus`] only ever
//! moves forward along
//! `pending → processing → (playing | failed | error) → completed`,
//! with `skipped` reachable only from `pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Opaque task identity, assigned at creation
pub type TaskId = Uuid;

/// Chat/room identifier that owns a voice session and a message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub i64);

impl DestinationId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for DestinationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Playing,
    Completed,
    /// Could not start (membership or fetch problem)
    Failed,
    /// Started, then broke (voice session problem or interrupted playback)
    Error,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Playing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Error,
        TaskStatus::Skipped,
    ];

    /// Stored string form
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Playing => "playing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Statuses from which a task may legally move into `self`
    pub fn predecessors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Processing => &[TaskStatus::Pending],
            TaskStatus::Playing => &[TaskStatus::Processing],
            TaskStatus::Failed => &[TaskStatus::Processing],
            TaskStatus::Error => &[TaskStatus::Processing, TaskStatus::Playing],
            TaskStatus::Completed => &[TaskStatus::Playing],
            TaskStatus::Skipped => &[TaskStatus::Pending],
        }
    }

    /// True if `self -> next` is a forward edge of the lifecycle
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.predecessors().contains(&self)
    }

    /// No further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Error | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::CorruptRecord(format!("unknown task status '{}'", s)))
    }
}

/// A persisted playback request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub destination: DestinationId,
    pub query: String,
    pub requester: String,
    /// Only used when the worker is not yet a member of the destination
    pub invite: Option<String>,
    pub status: TaskStatus,
    /// Resolved media title, set once playback starts
    pub title: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Submission payload for [`crate::TaskStore::enqueue_task`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub destination: DestinationId,
    pub query: String,
    pub requester: String,
    #[serde(default)]
    pub invite: Option<String>,
}
