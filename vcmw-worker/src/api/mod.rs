//! HTTP API for the music worker
//!
//! Keep-alive ping, task submission/inspection and manual controls.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use vcmw_common::TaskStore;

use crate::orchestrator::Orchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: TaskStore,
    /// Server port
    pub port: u16,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, port: u16) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            port,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check (no prefix for health endpoint)
        .route("/health", get(handlers::health))
        // API v1 routes
        .nest(
            "/api/v1",
            Router::new()
                .route("/tasks", post(handlers::submit_task))
                .route("/tasks/:task_id", get(handlers::get_task))
                .route("/destinations/:destination/session", get(handlers::get_session))
                .route("/destinations/:destination/stop", post(handlers::stop))
                .route("/destinations/:destination/skip", post(handlers::skip))
                .route("/destinations/:destination/pause", post(handlers::pause))
                .route("/destinations/:destination/resume", post(handlers::resume))
                .route("/chats/join", post(handlers::join_chat)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
