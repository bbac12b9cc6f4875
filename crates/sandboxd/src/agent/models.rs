//! Agent task data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub use crate::runner::AgentKind;

/// Task state as stored in the database. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// An agent task row.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    pub session_id: String,
    pub agent: AgentKind,
    pub prompt: String,
    pub working_dir: String,
    pub status: TaskStatus,
    pub output: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    #[serde(skip_serializing)]
    pub runner_task_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Whether a session has each provider key configured. Key material itself
/// never leaves the vault.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ApiKeyStatus {
    pub anthropic: bool,
    pub openai: bool,
}
