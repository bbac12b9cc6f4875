//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::container::PortMapping;

/// Session lifecycle status as stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Paused,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Paused => "paused",
        }
    }
}

/// A sandbox session row. Credential and key material never serializes out.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub subdomain: String,
    pub ssh_port: i64,
    pub http_port: i64,
    pub agent_port: i64,
    pub container_name: String,
    pub memory_limit: i64,
    pub cpu_limit: f64,
    pub status: SessionStatus,
    pub agent_enabled: bool,
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub last_accessed_at: String,
}

impl Session {
    /// The session's host port triple.
    pub fn ports(&self) -> PortMapping {
        PortMapping {
            ssh: self.ssh_port as u16,
            http: self.http_port as u16,
            agent: self.agent_port as u16,
        }
    }
}

/// Fields required to persist a freshly provisioned session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub username: String,
    pub password_hash: String,
    pub subdomain: String,
    pub ports: PortMapping,
    pub container_name: String,
    pub memory_limit: i64,
    pub cpu_limit: f64,
    pub expires_at: Option<String>,
}
