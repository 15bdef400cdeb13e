//! # VCMW Common Library
//!
//! Shared code for the voice-chat music worker and its submitters:
//! - Task model and the persistent Task Store
//! - Database initialization
//! - Worker event types (WorkerEvent enum) and EventBus
//! - Bootstrap configuration loading
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use db::models::{DestinationId, NewTask, Task, TaskId, TaskStatus};
pub use db::tasks::TaskStore;
pub use error::{Error, Result};
