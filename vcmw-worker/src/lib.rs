//! # VCMW Worker Library (vcmw-worker)
//!
//! Voice-chat music worker.
//!
//! **Purpose:** Claim queued playback requests from the shared Task Store,
//! fetch their audio, stream it into the destination's voice session and
//! record the outcome, with at most one active session per destination.
//!
//! **Architecture:** A polling [`Orchestrator`] drives one async pipeline
//! per claimed task over three collaborator seams (chat transport, voice
//! gateway, media fetcher), plus an axum control surface.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod notify;
pub mod orchestrator;

pub use error::{Error, Result};
pub use orchestrator::{Collaborators, ControlOutcome, Orchestrator};
