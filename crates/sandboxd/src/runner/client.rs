//! HTTP client for the in-container runner service.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;

use super::protocol::{
    CreateTaskRequest, HealthResponse, RunnerTask, TaskEnvelope, TaskListEnvelope,
};

/// Per-request deadline for control calls. Streams are exempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runner access abstraction. The port identifies the sandbox: each session's
/// runner listens on its own host agent port.
#[async_trait]
pub trait RunnerApi: Send + Sync {
    async fn create_task(&self, port: u16, req: &CreateTaskRequest) -> Result<RunnerTask>;
    /// `None` when the runner does not know the task.
    async fn get_task(&self, port: u16, id: &str) -> Result<Option<RunnerTask>>;
    async fn cancel_task(&self, port: u16, id: &str) -> Result<Option<RunnerTask>>;
}

/// reqwest-backed runner client.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    client: reqwest::Client,
}

impl RunnerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }

    pub async fn health(&self, port: u16) -> Result<HealthResponse> {
        self.client
            .get(Self::url(port, "/health"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("reaching runner health endpoint")?
            .json()
            .await
            .context("decoding runner health response")
    }

    pub async fn list_tasks(&self, port: u16) -> Result<Vec<RunnerTask>> {
        let envelope: TaskListEnvelope = self
            .client
            .get(Self::url(port, "/tasks"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("listing runner tasks")?
            .json()
            .await
            .context("decoding runner task list")?;
        Ok(envelope.tasks)
    }

    /// Open the task's SSE stream. The response body is a live event stream
    /// and is handed to the caller for proxying.
    pub async fn stream(&self, port: u16, id: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(Self::url(port, &format!("/tasks/{id}/stream")))
            .send()
            .await
            .context("opening runner task stream")?;
        if !response.status().is_success() {
            bail!("runner stream returned {}", response.status());
        }
        Ok(response)
    }
}

impl Default for RunnerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerApi for RunnerClient {
    async fn create_task(&self, port: u16, req: &CreateTaskRequest) -> Result<RunnerTask> {
        let response = self
            .client
            .post(Self::url(port, "/tasks"))
            .timeout(REQUEST_TIMEOUT)
            .json(req)
            .send()
            .await
            .context("submitting task to runner")?;

        if !response.status().is_success() {
            bail!("runner rejected task: {}", response.status());
        }

        let envelope: TaskEnvelope = response
            .json()
            .await
            .context("decoding runner task response")?;
        Ok(envelope.task)
    }

    async fn get_task(&self, port: u16, id: &str) -> Result<Option<RunnerTask>> {
        let response = self
            .client
            .get(Self::url(port, &format!("/tasks/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("fetching runner task")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("runner task fetch returned {}", response.status());
        }

        let envelope: TaskEnvelope = response
            .json()
            .await
            .context("decoding runner task response")?;
        Ok(Some(envelope.task))
    }

    async fn cancel_task(&self, port: u16, id: &str) -> Result<Option<RunnerTask>> {
        let response = self
            .client
            .delete(Self::url(port, &format!("/tasks/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("cancelling runner task")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("runner cancel returned {}", response.status());
        }

        let envelope: TaskEnvelope = response
            .json()
            .await
            .context("decoding runner cancel response")?;
        Ok(Some(envelope.task))
    }
}
