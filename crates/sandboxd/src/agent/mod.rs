//! Agent task pipeline: models, persistence and orchestration.

mod models;
mod repository;
mod service;

pub use models::{AgentKind, AgentTask, ApiKeyStatus, TaskStatus};
pub use repository::TaskRepository;
pub use service::{AgentError, AgentService, AgentTimings};
