//! Test helpers for vcmw-worker integration tests
//!
//! - `fakes`: in-memory chat, voice and fetch collaborators
//! - [`TestWorker`]: an orchestrator over a temp-file Task Store wired to the fakes
#![allow(dead_code)]

pub mod fakes;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use vcmw_common::config::WorkerConfig;
use vcmw_common::events::WorkerEvent;
use vcmw_common::{DestinationId, Task, TaskId, TaskStatus, TaskStore};
use vcmw_worker::{Collaborators, Orchestrator};

pub use fakes::{FakeChat, FakeFetcher, FakeVoice, VoiceCall};

pub const DEST: DestinationId = DestinationId(555);
pub const OTHER: DestinationId = DestinationId(777);
pub const LOG_CHAT: DestinationId = DestinationId(-100);

/// Timings short enough for tests; holds end after the fake track length
pub fn fast_settings() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 20,
        settle_delay_ms: 10,
        fallback_hold_secs: 1,
        hold_margin_secs: 0,
        collaborator_timeout_ms: 1000,
        fetch_timeout_secs: 5,
        max_join_attempts: 3,
        max_concurrent_pipelines: 8,
    }
}

pub struct TestWorker {
    pub orchestrator: Arc<Orchestrator>,
    pub store: TaskStore,
    pub chat: Arc<FakeChat>,
    pub voice: Arc<FakeVoice>,
    pub fetcher: Arc<FakeFetcher>,
    _dir: TempDir,
}

impl TestWorker {
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    pub async fn with_settings(settings: WorkerConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(&dir.path().join("tasks.db")).await.unwrap();

        let media_dir = dir.path().join("media");
        std::fs::create_dir_all(&media_dir).unwrap();

        let chat = Arc::new(FakeChat::default());
        chat.add_member(DEST);
        chat.add_member(OTHER);
        let voice = Arc::new(FakeVoice::default());
        let fetcher = Arc::new(FakeFetcher::new(media_dir));

        let orchestrator = Orchestrator::new(
            store.clone(),
            Collaborators {
                chat: chat.clone(),
                voice: voice.clone(),
                fetcher: fetcher.clone(),
            },
            settings,
            Some(LOG_CHAT),
        );

        Self {
            orchestrator,
            store,
            chat,
            voice,
            fetcher,
            _dir: dir,
        }
    }

    pub async fn enqueue(&self, destination: DestinationId, query: &str) -> TaskId {
        self.store
            .enqueue(destination, query, "alice", None)
            .await
            .unwrap()
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.orchestrator.events().subscribe()
    }

    pub fn spawn_loop(&self) -> JoinHandle<vcmw_worker::Result<()>> {
        tokio::spawn(Arc::clone(&self.orchestrator).run())
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.store.get(id).await.unwrap().expect("task exists")
    }

    /// Poll the store until `id` reaches `status`
    pub async fn wait_for_status(&self, id: TaskId, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.task(id).await;
            if task.status == status {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {} stuck in {} waiting for {}", id, task.status, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll the store until `id` is terminal
    pub async fn wait_terminal(&self, id: TaskId) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = self.task(id).await;
            if task.status.is_terminal() {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {} never finished, still {}", id, task.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Receive events until one matches, collecting everything seen on the way
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    seen: &mut Vec<WorkerEvent>,
    matches: F,
) -> WorkerEvent
where
    F: Fn(&WorkerEvent) -> bool,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    seen.push(event.clone());
                    if matches(&event) {
                        return event;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => panic!("event receiver lagged by {}", n),
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    result.expect("timed out waiting for event")
}

pub fn is_started(task_id: TaskId) -> impl Fn(&WorkerEvent) -> bool {
    move |e| matches!(e, WorkerEvent::PlaybackStarted { task_id: t, .. } if *t == task_id)
}

pub fn is_finished(task_id: TaskId) -> impl Fn(&WorkerEvent) -> bool {
    move |e| matches!(e, WorkerEvent::TaskFinished { task_id: t, .. } if *t == task_id)
}
