//! Agent task pipeline.
//!
//! Submission validates the session, decrypts the provider key, persists a
//! queued row, then forwards the task to the session's in-container runner.
//! Two background watchers drive the row to a terminal state: a poller that
//! mirrors the remote task, and a hard timeout that force-fails the row if
//! the runner stops answering. Either may fire first; the guarded terminal
//! update in the repository makes the race idempotent.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::container::ContainerDriver;
use crate::notify::Notifier;
use crate::runner::{AgentKind, CreateTaskRequest, RunnerApi, RunnerTaskStatus};
use crate::session::SessionRepository;
use crate::vault::{Vault, VaultError};

use super::models::{AgentTask, ApiKeyStatus, TaskStatus};
use super::repository::TaskRepository;

/// Errors surfaced by agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session not found")]
    SessionNotFound,

    #[error("task not found")]
    TaskNotFound,

    #[error("agent tasks are not enabled for this session")]
    NotEnabled,

    #[error("session container is not running")]
    NotRunning,

    #[error("no {0} api key configured for this session")]
    NoApiKey(&'static str),

    #[error("task belongs to a different session")]
    Forbidden,

    #[error("task has not been handed to the runner yet")]
    NotStarted,

    #[error("agent runner unreachable: {0}")]
    Upstream(anyhow::Error),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Poller cadence and the hard per-task deadline.
#[derive(Debug, Clone, Copy)]
pub struct AgentTimings {
    pub poll_interval: Duration,
    pub task_timeout: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            task_timeout: Duration::from_secs(60 * 60),
        }
    }
}

fn provider_name(agent: AgentKind) -> &'static str {
    match agent {
        AgentKind::Claude => "anthropic",
        AgentKind::Codex => "openai",
    }
}

fn terminal_status(status: RunnerTaskStatus) -> Option<TaskStatus> {
    match status {
        RunnerTaskStatus::Running => None,
        RunnerTaskStatus::Completed => Some(TaskStatus::Completed),
        RunnerTaskStatus::Failed => Some(TaskStatus::Failed),
        RunnerTaskStatus::Cancelled => Some(TaskStatus::Cancelled),
    }
}

/// Orchestrates agent tasks for all sessions.
#[derive(Clone)]
pub struct AgentService {
    sessions: SessionRepository,
    tasks: TaskRepository,
    vault: Vault,
    driver: Arc<dyn ContainerDriver>,
    runner: Arc<dyn RunnerApi>,
    notifier: Arc<dyn Notifier>,
    timings: AgentTimings,
}

impl AgentService {
    pub fn new(
        sessions: SessionRepository,
        tasks: TaskRepository,
        vault: Vault,
        driver: Arc<dyn ContainerDriver>,
        runner: Arc<dyn RunnerApi>,
        notifier: Arc<dyn Notifier>,
        timings: AgentTimings,
    ) -> Self {
        Self {
            sessions,
            tasks,
            vault,
            driver,
            runner,
            notifier,
            timings,
        }
    }

    /// Submit a task. Validation happens before any row is written, so a
    /// rejected submission leaves no trace.
    pub async fn submit(
        &self,
        username: &str,
        agent: AgentKind,
        prompt: &str,
        working_dir: Option<String>,
    ) -> Result<AgentTask, AgentError> {
        let session = self
            .sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;

        if !session.agent_enabled {
            return Err(AgentError::NotEnabled);
        }
        if self.driver.status(&session.container_name).await != "running" {
            return Err(AgentError::NotRunning);
        }

        let blob = match agent {
            AgentKind::Claude => session.anthropic_api_key.as_deref(),
            AgentKind::Codex => session.openai_api_key.as_deref(),
        }
        .ok_or(AgentError::NoApiKey(provider_name(agent)))?;
        let api_key = self.vault.decrypt(blob)?;

        let working_dir = working_dir.unwrap_or_else(|| "~/".to_string());
        let task = self
            .tasks
            .insert_queued(&session.id, agent, prompt, &working_dir)
            .await?;

        let request = CreateTaskRequest {
            agent,
            prompt: prompt.to_string(),
            working_dir,
            api_key,
        };
        let port = session.ports().agent;

        let remote = match self.runner.create_task(port, &request).await {
            Ok(remote) => remote,
            Err(e) => {
                // The row stays behind as a permanent failure record.
                let message = format!("{e:#}");
                if let Err(f) = self
                    .tasks
                    .finish(&task.id, TaskStatus::Failed, None, None, Some(&message))
                    .await
                {
                    warn!("task {} not marked failed: {f:#}", task.id);
                }
                return Err(AgentError::Upstream(e));
            }
        };

        self.tasks.mark_running(&task.id, &remote.id).await?;
        self.spawn_watchers(
            username.to_string(),
            task.id.clone(),
            port,
            remote.id.clone(),
        );

        self.tasks
            .get(&task.id)
            .await?
            .ok_or(AgentError::TaskNotFound)
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    pub async fn cancel(&self, username: &str, task_id: &str) -> Result<AgentTask, AgentError> {
        let (session, task) = self.owned_task(username, task_id).await?;

        if task.status.is_terminal() {
            return Ok(task);
        }

        if let Some(runner_id) = &task.runner_task_id {
            let port = session.ports().agent;
            if let Err(e) = self.runner.cancel_task(port, runner_id).await {
                warn!("remote cancel for task {task_id} failed: {e:#}");
            }
        }

        self.tasks
            .finish(task_id, TaskStatus::Cancelled, None, None, None)
            .await?;
        self.tasks
            .get(task_id)
            .await?
            .ok_or(AgentError::TaskNotFound)
    }

    pub async fn get(&self, username: &str, task_id: &str) -> Result<AgentTask, AgentError> {
        let (_, task) = self.owned_task(username, task_id).await?;
        Ok(task)
    }

    pub async fn list(&self, username: &str) -> Result<Vec<AgentTask>, AgentError> {
        let session = self
            .sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;
        Ok(self.tasks.list_for_session(&session.id).await?)
    }

    /// Runner address and remote id for proxying a task's output stream.
    pub async fn stream_target(
        &self,
        username: &str,
        task_id: &str,
    ) -> Result<(u16, String), AgentError> {
        let (session, task) = self.owned_task(username, task_id).await?;
        let runner_id = task.runner_task_id.ok_or(AgentError::NotStarted)?;
        Ok((session.ports().agent, runner_id))
    }

    pub async fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), AgentError> {
        self.sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;
        self.sessions.set_agent_enabled(username, enabled).await?;
        Ok(())
    }

    /// Encrypt and store the provided keys; absent ones are left alone.
    pub async fn set_api_keys(
        &self,
        username: &str,
        anthropic: Option<&str>,
        openai: Option<&str>,
    ) -> Result<ApiKeyStatus, AgentError> {
        self.sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;

        let anthropic_blob = anthropic.map(|key| self.vault.encrypt(key)).transpose()?;
        let openai_blob = openai.map(|key| self.vault.encrypt(key)).transpose()?;
        self.sessions
            .update_api_keys(username, anthropic_blob.as_deref(), openai_blob.as_deref())
            .await?;

        self.key_status(username).await
    }

    pub async fn key_status(&self, username: &str) -> Result<ApiKeyStatus, AgentError> {
        let session = self
            .sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;
        Ok(ApiKeyStatus {
            anthropic: session.anthropic_api_key.is_some(),
            openai: session.openai_api_key.is_some(),
        })
    }

    async fn owned_task(
        &self,
        username: &str,
        task_id: &str,
    ) -> Result<(crate::session::Session, AgentTask), AgentError> {
        let session = self
            .sessions
            .get(username)
            .await?
            .ok_or(AgentError::SessionNotFound)?;
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(AgentError::TaskNotFound)?;
        if task.session_id != session.id {
            return Err(AgentError::Forbidden);
        }
        Ok((session, task))
    }

    fn spawn_watchers(&self, username: String, task_id: String, port: u16, runner_id: String) {
        let poller = self.clone();
        let poll_username = username.clone();
        let poll_task = task_id.clone();
        let poll_runner = runner_id.clone();
        tokio::spawn(async move {
            poller
                .poll_until_terminal(&poll_username, &poll_task, port, &poll_runner)
                .await;
        });

        let enforcer = self.clone();
        tokio::spawn(async move {
            enforcer
                .enforce_timeout(&username, &task_id, port, &runner_id)
                .await;
        });
    }

    async fn poll_until_terminal(&self, username: &str, task_id: &str, port: u16, runner_id: &str) {
        loop {
            tokio::time::sleep(self.timings.poll_interval).await;

            let row = match self.tasks.get(task_id).await {
                Ok(Some(row)) => row,
                Ok(None) => return,
                Err(e) => {
                    warn!("poller for task {task_id} lost the row: {e:#}");
                    return;
                }
            };
            if row.status.is_terminal() {
                return;
            }

            match self.runner.get_task(port, runner_id).await {
                Ok(Some(remote)) => {
                    let Some(status) = terminal_status(remote.status) else {
                        if let Err(e) = self.tasks.update_output(task_id, &remote.output).await {
                            warn!("task {task_id} output not refreshed: {e:#}");
                        }
                        continue;
                    };

                    let finished = self
                        .tasks
                        .finish(
                            task_id,
                            status,
                            Some(&remote.output),
                            remote.exit_code.map(i64::from),
                            remote.error.as_deref(),
                        )
                        .await
                        .unwrap_or(false);
                    if finished {
                        self.notify_finished(username, task_id).await;
                    }
                    return;
                }
                Ok(None) => {
                    let finished = self
                        .tasks
                        .finish(
                            task_id,
                            TaskStatus::Failed,
                            None,
                            None,
                            Some("task disappeared from the runner"),
                        )
                        .await
                        .unwrap_or(false);
                    if finished {
                        self.notify_finished(username, task_id).await;
                    }
                    return;
                }
                // Transient; the timeout backstops a runner that never
                // comes back.
                Err(e) => warn!("polling task {task_id} failed: {e:#}"),
            }
        }
    }

    async fn enforce_timeout(&self, username: &str, task_id: &str, port: u16, runner_id: &str) {
        tokio::time::sleep(self.timings.task_timeout).await;

        let timed_out = self
            .tasks
            .finish(
                task_id,
                TaskStatus::Failed,
                None,
                None,
                Some("task timed out"),
            )
            .await
            .unwrap_or(false);

        if timed_out {
            warn!("task {task_id} hit the execution timeout, cancelling remotely");
            if let Err(e) = self.runner.cancel_task(port, runner_id).await {
                warn!("remote cancel for timed-out task {task_id} failed: {e:#}");
            }
            self.notify_finished(username, task_id).await;
        }
    }

    async fn notify_finished(&self, username: &str, task_id: &str) {
        match self.tasks.get(task_id).await {
            Ok(Some(task)) => self.notifier.task_finished(username, &task).await,
            Ok(None) => {}
            Err(e) => warn!("notification lookup for task {task_id} failed: {e:#}"),
        }
    }
}
