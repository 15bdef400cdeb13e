//! External collaborator contracts
//!
//! **Purpose:** The orchestrator never talks to a chat network, a voice
//! service or a downloader directly. It goes through three seams:
//! - [`ChatTransport`]: membership checks, invite joins, text messages
//! - [`VoiceGateway`]: join/leave a destination's voice session and control its stream
//! - [`MediaFetcher`]: turn a free-text query or URL into a local audio file
//!
//! Production implementations live in [`bridge`] (HTTP bridge process for
//! chat and voice) and [`ytdlp`] (external downloader). Tests substitute
//! in-memory fakes.

pub mod bridge;
pub mod ytdlp;

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vcmw_common::{DestinationId, TaskId};

pub use bridge::BridgeClient;
pub use ytdlp::YtDlpFetcher;

/// Chat transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The transport refused the request (bad invite, banned, no rights)
    #[error("chat request rejected: {0}")]
    Rejected(String),

    /// The transport could not be reached or answered nonsense
    #[error("chat transport unavailable: {0}")]
    Transport(String),
}

/// Voice gateway failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// A session already exists in the destination; replace its stream instead
    #[error("voice session already active in {0}")]
    AlreadyJoined(DestinationId),

    /// No session exists in the destination
    #[error("no voice session in {0}")]
    NotJoined(DestinationId),

    /// The gateway refused the request
    #[error("voice gateway rejected request: {0}")]
    Rejected(String),

    /// The gateway could not be reached or answered nonsense
    #[error("voice gateway unavailable: {0}")]
    Transport(String),
}

/// Media fetch failures
#[derive(Error, Debug)]
pub enum FetchError {
    /// Search returned nothing playable
    #[error("no result for '{0}'")]
    NoResult(String),

    /// Downloader claimed success but the file is not on disk
    #[error("fetched file missing: {}", .0.display())]
    MissingFile(PathBuf),

    /// Downloader exited with an error
    #[error("downloader failed: {0}")]
    Downloader(String),

    /// Downloader could not be started or its output could not be written
    #[error("downloader I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat network seam
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Whether the worker's account is currently a member of `destination`
    async fn is_member(&self, destination: DestinationId) -> Result<bool, ChatError>;

    /// Join a destination through an invite link or handle
    async fn join_by_invite(&self, invite: &str) -> Result<(), ChatError>;

    async fn send_message(&self, destination: DestinationId, text: &str) -> Result<(), ChatError>;
}

/// Voice session seam
///
/// At most one session per destination exists on the gateway side. `join`
/// on a destination that already has one fails with
/// [`VoiceError::AlreadyJoined`]; callers then use `replace_stream`.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join(&self, destination: DestinationId, source: &std::path::Path) -> Result<(), VoiceError>;

    async fn replace_stream(
        &self,
        destination: DestinationId,
        source: &std::path::Path,
    ) -> Result<(), VoiceError>;

    async fn leave(&self, destination: DestinationId) -> Result<(), VoiceError>;

    async fn pause(&self, destination: DestinationId) -> Result<(), VoiceError>;

    async fn resume(&self, destination: DestinationId) -> Result<(), VoiceError>;

    async fn is_active(&self, destination: DestinationId) -> Result<bool, VoiceError>;

    /// Resolves when the current stream in `destination` finishes
    ///
    /// `Ok(())` means the stream ran out normally; an error means the session
    /// broke while playing. Gateways without end-of-stream events keep the
    /// default, which never resolves, and the orchestrator's hold window
    /// decides instead.
    async fn wait_stream_end(&self, _destination: DestinationId) -> Result<(), VoiceError> {
        std::future::pending::<Result<(), VoiceError>>().await
    }
}

/// What to fetch and where it is going
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub query: String,
    pub destination: DestinationId,
    pub task_id: TaskId,
}

/// A locally available audio file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub title: String,
    /// Track length when the source reports one
    pub duration: Option<Duration>,
}

/// Media fetch seam
///
/// Fetching is blocking work (an external process plus disk I/O); the
/// orchestrator runs it on the blocking pool and bounds it with a timeout.
pub trait MediaFetcher: Send + Sync + 'static {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, FetchError>;
}
