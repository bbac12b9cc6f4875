//! Wire types shared between the orchestrator and the in-container runner.

use serde::{Deserialize, Serialize};

/// Supported CLI agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }
}

/// Runner-side task state. Runner tasks start executing immediately, so
/// there is no queued state on this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerTaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

fn default_working_dir() -> String {
    "~/".to_string()
}

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub agent: AgentKind,
    pub prompt: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    pub api_key: String,
}

/// A task as the runner reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerTask {
    pub id: String,
    pub agent: AgentKind,
    pub prompt: String,
    pub working_dir: String,
    pub status: RunnerTaskStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: RunnerTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListEnvelope {
    pub tasks: Vec<RunnerTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub tasks: usize,
}

/// Server-sent event emitted on a task's stream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Output {
        data: String,
    },
    Done {
        status: RunnerTaskStatus,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
}
