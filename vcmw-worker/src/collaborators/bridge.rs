//! HTTP client for the chat/voice bridge process
//!
//! The bridge owns the user-account session on the chat network and the
//! voice-call library. It exposes a small JSON API; this client maps it onto
//! [`ChatTransport`] and [`VoiceGateway`].
//!
//! | Operation          | Request                               | Notable statuses          |
//! |--------------------|---------------------------------------|---------------------------|
//! | is_member          | `GET  /chats/{id}/membership`         |                           |
//! | join_by_invite     | `POST /chats/join`                    |                           |
//! | send_message       | `POST /chats/{id}/messages`           |                           |
//! | join               | `POST /voice/{id}/join`               | 409 already joined        |
//! | replace_stream     | `POST /voice/{id}/stream`             | 404 not joined            |
//! | leave/pause/resume | `POST /voice/{id}/{leave,pause,resume}` | 404 not joined          |
//! | is_active          | `GET  /voice/{id}`                    |                           |
//! | wait_stream_end    | `GET  /voice/{id}/stream-end`         | 410 session dropped       |

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use vcmw_common::DestinationId;

use super::{ChatError, ChatTransport, VoiceError, VoiceGateway};

const USER_AGENT: &str = concat!("vcmw-worker/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct MembershipResponse {
    member: bool,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    active: bool,
}

/// Bridge API client
///
/// No client-wide timeout: the stream-end request is a long poll. The
/// orchestrator bounds every other call itself.
#[derive(Clone)]
pub struct BridgeClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn voice_post(
        &self,
        destination: DestinationId,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, VoiceError> {
        let url = self.url(&format!("/voice/{}/{}", destination, action));
        debug!(destination = %destination, url = %url, "Voice request");

        let mut request = self.http_client.post(&url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))
    }
}

async fn error_text(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    }
}

async fn voice_result(
    destination: DestinationId,
    response: reqwest::Response,
) -> Result<(), VoiceError> {
    match response.status() {
        s if s.is_success() => Ok(()),
        StatusCode::CONFLICT => Err(VoiceError::AlreadyJoined(destination)),
        StatusCode::NOT_FOUND => Err(VoiceError::NotJoined(destination)),
        s if s.is_server_error() => Err(VoiceError::Transport(error_text(response).await)),
        _ => Err(VoiceError::Rejected(error_text(response).await)),
    }
}

async fn chat_result(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() {
        Err(ChatError::Transport(error_text(response).await))
    } else {
        Err(ChatError::Rejected(error_text(response).await))
    }
}

#[async_trait]
impl ChatTransport for BridgeClient {
    async fn is_member(&self, destination: DestinationId) -> Result<bool, ChatError> {
        let response = self
            .http_client
            .get(self.url(&format!("/chats/{}/membership", destination)))
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let membership: MembershipResponse = chat_result(response)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::Transport(format!("bad membership response: {}", e)))?;
        Ok(membership.member)
    }

    async fn join_by_invite(&self, invite: &str) -> Result<(), ChatError> {
        let response = self
            .http_client
            .post(self.url("/chats/join"))
            .json(&json!({ "invite": invite }))
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        chat_result(response).await.map(|_| ())
    }

    async fn send_message(&self, destination: DestinationId, text: &str) -> Result<(), ChatError> {
        let response = self
            .http_client
            .post(self.url(&format!("/chats/{}/messages", destination)))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        chat_result(response).await.map(|_| ())
    }
}

#[async_trait]
impl VoiceGateway for BridgeClient {
    async fn join(&self, destination: DestinationId, source: &Path) -> Result<(), VoiceError> {
        let body = json!({ "source": source.to_string_lossy() });
        let response = self.voice_post(destination, "join", Some(body)).await?;
        voice_result(destination, response).await
    }

    async fn replace_stream(&self, destination: DestinationId, source: &Path) -> Result<(), VoiceError> {
        let body = json!({ "source": source.to_string_lossy() });
        let response = self.voice_post(destination, "stream", Some(body)).await?;
        voice_result(destination, response).await
    }

    async fn leave(&self, destination: DestinationId) -> Result<(), VoiceError> {
        let response = self.voice_post(destination, "leave", None).await?;
        voice_result(destination, response).await
    }

    async fn pause(&self, destination: DestinationId) -> Result<(), VoiceError> {
        let response = self.voice_post(destination, "pause", None).await?;
        voice_result(destination, response).await
    }

    async fn resume(&self, destination: DestinationId) -> Result<(), VoiceError> {
        let response = self.voice_post(destination, "resume", None).await?;
        voice_result(destination, response).await
    }

    async fn is_active(&self, destination: DestinationId) -> Result<bool, VoiceError> {
        let response = self
            .http_client
            .get(self.url(&format!("/voice/{}", destination)))
            .send()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(VoiceError::Transport(error_text(response).await));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Transport(format!("bad session response: {}", e)))?;
        Ok(session.active)
    }

    async fn wait_stream_end(&self, destination: DestinationId) -> Result<(), VoiceError> {
        let url = self.url(&format!("/voice/{}/stream-end", destination));
        let outcome = self.http_client.get(&url).send().await;

        match outcome {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) if response.status() == StatusCode::GONE => Err(VoiceError::Rejected(
                format!("voice session in {} dropped", destination),
            )),
            Ok(response) => {
                debug!(
                    destination = %destination,
                    status = %response.status(),
                    "Bridge has no stream-end signal, relying on hold window"
                );
                std::future::pending().await
            }
            Err(e) => {
                debug!(destination = %destination, error = %e, "Stream-end poll failed, relying on hold window");
                std::future::pending().await
            }
        }
    }
}

/// Convenience for callers that only need a reachability probe
pub async fn probe(client: &BridgeClient, timeout: Duration) -> bool {
    client
        .http_client
        .get(client.url("/health"))
        .timeout(timeout)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}
