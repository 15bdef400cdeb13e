//! In-memory collaborators for orchestrator tests
//!
//! Each fake records what the orchestrator asked of it and can be told to
//! fail in specific ways.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vcmw_common::DestinationId;
use vcmw_worker::collaborators::{
    ChatError, ChatTransport, FetchError, FetchRequest, FetchedMedia, MediaFetcher, VoiceError,
    VoiceGateway,
};

// ============================================================================
// Chat transport
// ============================================================================

#[derive(Default)]
pub struct FakeChat {
    members: Mutex<HashSet<DestinationId>>,
    invites: Mutex<HashMap<String, DestinationId>>,
    joined: Mutex<Vec<String>>,
    messages: Mutex<Vec<(DestinationId, String)>>,
    pub fail_send: AtomicBool,
    pub fail_membership_check: AtomicBool,
}

impl FakeChat {
    pub fn add_member(&self, destination: DestinationId) {
        self.members.lock().unwrap().insert(destination);
    }

    pub fn remove_member(&self, destination: DestinationId) {
        self.members.lock().unwrap().remove(&destination);
    }

    /// Make `invite` a working invite into `destination`
    pub fn add_invite(&self, invite: &str, destination: DestinationId) {
        self.invites
            .lock()
            .unwrap()
            .insert(invite.to_string(), destination);
    }

    pub fn joined_invites(&self) -> Vec<String> {
        self.joined.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(DestinationId, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn messages_to(&self, destination: DestinationId) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn is_member(&self, destination: DestinationId) -> Result<bool, ChatError> {
        if self.fail_membership_check.load(Ordering::SeqCst) {
            return Err(ChatError::Rejected("CHANNEL_PRIVATE".to_string()));
        }
        Ok(self.members.lock().unwrap().contains(&destination))
    }

    async fn join_by_invite(&self, invite: &str) -> Result<(), ChatError> {
        let target = self.invites.lock().unwrap().get(invite).copied();
        match target {
            Some(destination) => {
                self.members.lock().unwrap().insert(destination);
                self.joined.lock().unwrap().push(invite.to_string());
                Ok(())
            }
            None => Err(ChatError::Rejected(format!("INVITE_HASH_INVALID: {}", invite))),
        }
    }

    async fn send_message(&self, destination: DestinationId, text: &str) -> Result<(), ChatError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("flood wait".to_string()));
        }
        self.messages
            .lock()
            .unwrap()
            .push((destination, text.to_string()));
        Ok(())
    }
}

// ============================================================================
// Voice gateway
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCall {
    Join(DestinationId),
    Replace(DestinationId),
    Leave(DestinationId),
    Pause(DestinationId),
    Resume(DestinationId),
}

/// Voice gateway that keeps one call per destination, like the real one
#[derive(Default)]
pub struct FakeVoice {
    /// destination -> (source, paused)
    sessions: Mutex<HashMap<DestinationId, (PathBuf, bool)>>,
    calls: Mutex<Vec<VoiceCall>>,
    /// Fail this many join/replace attempts with a transport error
    pub failing_attempts: AtomicU32,
    /// Fail every join/replace attempt
    pub reject_all: AtomicBool,
    /// Report no session from `is_active` even when one exists
    pub hide_active: AtomicBool,
    /// Stream ends this long after `wait_stream_end` is called
    pub stream_end_after: Mutex<Option<Duration>>,
    /// `wait_stream_end` reports a dropped session
    pub break_stream: AtomicBool,
    /// Per-join latency, consumed one entry per `join` call
    join_delays: Mutex<VecDeque<Duration>>,
}

impl FakeVoice {
    pub fn calls(&self) -> Vec<VoiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_session(&self, destination: DestinationId) -> bool {
        self.sessions.lock().unwrap().contains_key(&destination)
    }

    pub fn is_paused(&self, destination: DestinationId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(&destination)
            .is_some_and(|(_, paused)| *paused)
    }

    pub fn current_source(&self, destination: DestinationId) -> Option<PathBuf> {
        self.sessions
            .lock()
            .unwrap()
            .get(&destination)
            .map(|(source, _)| source.clone())
    }

    /// Pretend a call already exists (left over from an earlier run)
    pub fn open_session(&self, destination: DestinationId) {
        self.sessions
            .lock()
            .unwrap()
            .insert(destination, (PathBuf::from("/previous"), false));
    }

    /// Make the next `join` take `delay` before it answers
    pub fn delay_next_join(&self, delay: Duration) {
        self.join_delays.lock().unwrap().push_back(delay);
    }

    fn record(&self, call: VoiceCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected_failure(&self) -> Option<VoiceError> {
        if self.reject_all.load(Ordering::SeqCst) {
            return Some(VoiceError::Transport("GROUPCALL_FORBIDDEN".to_string()));
        }
        let consumed = self
            .failing_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        consumed.then(|| VoiceError::Transport("connection reset".to_string()))
    }
}

#[async_trait]
impl VoiceGateway for FakeVoice {
    async fn join(&self, destination: DestinationId, source: &Path) -> Result<(), VoiceError> {
        self.record(VoiceCall::Join(destination));
        let delay = self.join_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.injected_failure() {
            return Err(e);
        }
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&destination) {
            return Err(VoiceError::AlreadyJoined(destination));
        }
        sessions.insert(destination, (source.to_path_buf(), false));
        Ok(())
    }

    async fn replace_stream(&self, destination: DestinationId, source: &Path) -> Result<(), VoiceError> {
        self.record(VoiceCall::Replace(destination));
        if let Some(e) = self.injected_failure() {
            return Err(e);
        }
        match self.sessions.lock().unwrap().get_mut(&destination) {
            Some(session) => {
                *session = (source.to_path_buf(), false);
                Ok(())
            }
            None => Err(VoiceError::NotJoined(destination)),
        }
    }

    async fn leave(&self, destination: DestinationId) -> Result<(), VoiceError> {
        self.record(VoiceCall::Leave(destination));
        match self.sessions.lock().unwrap().remove(&destination) {
            Some(_) => Ok(()),
            None => Err(VoiceError::NotJoined(destination)),
        }
    }

    async fn pause(&self, destination: DestinationId) -> Result<(), VoiceError> {
        self.record(VoiceCall::Pause(destination));
        match self.sessions.lock().unwrap().get_mut(&destination) {
            Some(session) => {
                session.1 = true;
                Ok(())
            }
            None => Err(VoiceError::NotJoined(destination)),
        }
    }

    async fn resume(&self, destination: DestinationId) -> Result<(), VoiceError> {
        self.record(VoiceCall::Resume(destination));
        match self.sessions.lock().unwrap().get_mut(&destination) {
            Some(session) => {
                session.1 = false;
                Ok(())
            }
            None => Err(VoiceError::NotJoined(destination)),
        }
    }

    async fn is_active(&self, destination: DestinationId) -> Result<bool, VoiceError> {
        if self.hide_active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.has_session(destination))
    }

    async fn wait_stream_end(&self, destination: DestinationId) -> Result<(), VoiceError> {
        if self.break_stream.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(VoiceError::Rejected(format!("call in {} dropped", destination)));
        }
        let after = *self.stream_end_after.lock().unwrap();
        match after {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Media fetcher
// ============================================================================

/// Writes a small file per request and tracks overlapping fetches
pub struct FakeFetcher {
    dir: PathBuf,
    /// Reported track length
    pub duration: Mutex<Option<Duration>>,
    /// Time spent "downloading"
    pub delay: Mutex<Duration>,
    failing: Mutex<HashSet<String>>,
    /// Queries answered with a path that was never written
    unwritten: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<DestinationId, usize>>,
    max_in_flight: Mutex<HashMap<DestinationId, usize>>,
    global: AtomicUsize,
    max_global: AtomicUsize,
    produced: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            duration: Mutex::new(Some(Duration::from_millis(50))),
            delay: Mutex::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
            unwritten: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            global: AtomicUsize::new(0),
            max_global: AtomicUsize::new(0),
            produced: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_query(&self, query: &str) {
        self.failing.lock().unwrap().insert(query.to_string());
    }

    /// Report success for `query` without producing the file
    pub fn report_missing_file(&self, query: &str) {
        self.unwritten.lock().unwrap().insert(query.to_string());
    }

    pub fn set_duration(&self, duration: Option<Duration>) {
        *self.duration.lock().unwrap() = duration;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn produced(&self) -> Vec<PathBuf> {
        self.produced.lock().unwrap().clone()
    }

    /// Highest number of overlapping fetches seen for `destination`
    pub fn max_in_flight(&self, destination: DestinationId) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(&destination)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of overlapping fetches across all destinations
    pub fn max_global(&self) -> usize {
        self.max_global.load(Ordering::SeqCst)
    }

    fn enter(&self, destination: DestinationId) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(destination).or_insert(0);
        *count += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let seen = max.entry(destination).or_insert(0);
        *seen = (*seen).max(*count);

        let now = self.global.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_global.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self, destination: DestinationId) {
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&destination) {
            *count -= 1;
        }
        self.global.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeFetcher {
    fn produce(&self, request: &FetchRequest) -> Result<FetchedMedia, FetchError> {
        if self.failing.lock().unwrap().contains(&request.query) {
            return Err(FetchError::NoResult(request.query.clone()));
        }
        let path = self
            .dir
            .join(format!("{}-{}.m4a", request.destination, request.task_id));
        if !self.unwritten.lock().unwrap().contains(&request.query) {
            std::fs::write(&path, b"not really audio")?;
            self.produced.lock().unwrap().push(path.clone());
        }
        Ok(FetchedMedia {
            path,
            title: format!("Title of {}", request.query),
            duration: *self.duration.lock().unwrap(),
        })
    }
}

impl MediaFetcher for FakeFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, FetchError> {
        self.enter(request.destination);
        let delay = *self.delay.lock().unwrap();
        std::thread::sleep(delay);

        let result = self.produce(request);
        self.exit(request.destination);
        result
    }
}
