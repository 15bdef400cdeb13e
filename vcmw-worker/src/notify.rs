//! Best-effort chat notifications
//!
//! Announcements to a destination and to the optional operator log chat.
//! A failed notification is logged and never changes a task's outcome.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use vcmw_common::DestinationId;

use crate::collaborators::ChatTransport;
use crate::{Error, Result};

#[derive(Clone)]
pub struct Notifier {
    chat: Arc<dyn ChatTransport>,
    log_chat: Option<DestinationId>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatTransport>, log_chat: Option<DestinationId>, timeout: Duration) -> Self {
        Self {
            chat,
            log_chat,
            timeout,
        }
    }

    /// Send and report the outcome
    pub async fn send(&self, destination: DestinationId, text: &str) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.chat.send_message(destination, text)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(format!(
                "send_message to {} after {:?}",
                destination, self.timeout
            ))),
        }
    }

    pub async fn announce(&self, destination: DestinationId, text: &str) {
        if let Err(e) = self.send(destination, text).await {
            warn!(destination = %destination, error = %e, "Notification not delivered");
        }
    }

    /// Post to the operator log chat, if one is configured
    pub async fn log(&self, text: &str) {
        if let Some(log_chat) = self.log_chat {
            self.announce(log_chat, text).await;
        }
    }
}

pub fn now_playing(title: &str, requester: &str) -> String {
    format!("Now playing: {}\nRequested by: {}", title, requester)
}

pub fn searching(query: &str, destination: DestinationId) -> String {
    format!("Searching: {} (for {})", query, destination)
}

pub fn not_played(query: &str, destination: DestinationId, detail: &str) -> String {
    format!("Could not play '{}' in {}: {}", query, destination, detail)
}

/// Sent to the log chat once at startup
pub fn startup(version: &str, cookies_found: bool) -> String {
    format!(
        "Music worker v{} started\nCookies: {}",
        version,
        if cookies_found { "found" } else { "not found" }
    )
}

pub fn fatal(error: &Error) -> String {
    format!("Music worker stopping: {}", error)
}
