//! Agent task persistence.
//!
//! Terminal-state writes are guarded so the poller, the timeout timer and
//! explicit cancellation can all race on the same row safely: only one of
//! them wins the transition out of `queued`/`running`, the rest are no-ops.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{AgentKind, AgentTask, TaskStatus};

#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new task in `queued` state.
    pub async fn insert_queued(
        &self,
        session_id: &str,
        agent: AgentKind,
        prompt: &str,
        working_dir: &str,
    ) -> Result<AgentTask> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO agent_tasks (id, session_id, agent, prompt, working_dir, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(agent.as_str())
        .bind(prompt)
        .bind(working_dir)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("inserting agent task")?;

        self.get(&id)
            .await?
            .context("task row missing immediately after insert")
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentTask>> {
        sqlx::query_as::<_, AgentTask>("SELECT * FROM agent_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("loading agent task")
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<AgentTask>> {
        sqlx::query_as::<_, AgentTask>(
            "SELECT * FROM agent_tasks WHERE session_id = ? ORDER BY created_at DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing agent tasks")
    }

    /// Transition `queued -> running`, recording the runner-side task id.
    /// Returns false if the task already left `queued`.
    pub async fn mark_running(&self, id: &str, runner_task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent_tasks SET status = 'running', runner_task_id = ?, started_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(runner_task_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking task running")?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh the accumulated output of a still-running task.
    pub async fn update_output(&self, id: &str, output: &str) -> Result<()> {
        sqlx::query("UPDATE agent_tasks SET output = ? WHERE id = ? AND status = 'running'")
            .bind(output)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating task output")?;
        Ok(())
    }

    /// Transition to a terminal state. Only succeeds from `queued` or
    /// `running`; returns whether this call won the transition. A `None`
    /// output keeps whatever was already accumulated.
    pub async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        output: Option<&str>,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let result = sqlx::query(
            "UPDATE agent_tasks
             SET status = ?, output = COALESCE(?, output), exit_code = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(exit_code)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("finishing agent task")?;
        Ok(result.rows_affected() > 0)
    }
}
