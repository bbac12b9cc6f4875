//! Session persistence.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{NewSession, Session, SessionStatus};

/// Repository for session rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a provisioned session with `status = running`.
    ///
    /// Unique-constraint violations bubble up as database errors; the caller
    /// maps them to a conflict.
    pub async fn create(&self, new: &NewSession) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO sessions (id, username, password_hash, subdomain, ssh_port, http_port, agent_port, container_name, memory_limit, cpu_limit, status, created_at, expires_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'running', ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(&new.subdomain)
        .bind(i64::from(new.ports.ssh))
        .bind(i64::from(new.ports.http))
        .bind(i64::from(new.ports.agent))
        .bind(&new.container_name)
        .bind(new.memory_limit)
        .bind(new.cpu_limit)
        .bind(&now)
        .bind(&new.expires_at)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&new.username)
            .await?
            .context("session row missing immediately after insert")
    }

    pub async fn get(&self, username: &str) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("loading session")
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        sqlx::query_as::<_, Session>("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")
    }

    /// Delete a session row. Returns whether a row existed. Agent tasks
    /// cascade with the row.
    pub async fn delete(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(&self, username: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE username = ?")
            .bind(status.as_str())
            .bind(username)
            .execute(&self.pool)
            .await
            .context("updating session status")?;
        Ok(())
    }

    /// Set `status = running` and refresh the access timestamp.
    pub async fn mark_running(&self, username: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'running', last_accessed_at = ? WHERE username = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(username)
            .execute(&self.pool)
            .await
            .context("marking session running")?;
        Ok(())
    }

    /// Refresh the access timestamp only.
    pub async fn touch(&self, username: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_accessed_at = ? WHERE username = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(username)
            .execute(&self.pool)
            .await
            .context("touching session")?;
        Ok(())
    }

    pub async fn set_agent_enabled(&self, username: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE sessions SET agent_enabled = ? WHERE username = ?")
            .bind(enabled)
            .bind(username)
            .execute(&self.pool)
            .await
            .context("updating agent flag")?;
        Ok(())
    }

    /// Overwrite the encrypted API key blobs that are present; `None` leaves
    /// the stored value untouched.
    pub async fn update_api_keys(
        &self,
        username: &str,
        anthropic: Option<&str>,
        openai: Option<&str>,
    ) -> Result<()> {
        if let Some(blob) = anthropic {
            sqlx::query("UPDATE sessions SET anthropic_api_key = ? WHERE username = ?")
                .bind(blob)
                .bind(username)
                .execute(&self.pool)
                .await
                .context("updating anthropic key")?;
        }
        if let Some(blob) = openai {
            sqlx::query("UPDATE sessions SET openai_api_key = ? WHERE username = ?")
                .bind(blob)
                .bind(username)
                .execute(&self.pool)
                .await
                .context("updating openai key")?;
        }
        Ok(())
    }

    /// Sessions whose expiry timestamp has passed.
    pub async fn expired(&self) -> Result<Vec<Session>> {
        sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("listing expired sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PortMapping;
    use crate::db::Database;

    fn new_session(username: &str, offset: u16) -> NewSession {
        NewSession {
            username: username.to_string(),
            password_hash: "$2b$12$hash".to_string(),
            subdomain: format!("{username}-http-sandbox.example.com"),
            ports: PortMapping {
                ssh: 2200 + offset,
                http: 3200 + offset,
                agent: 9100 + offset,
            },
            container_name: format!("sandbox-{username}"),
            memory_limit: 256,
            cpu_limit: 0.5,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        let session = repo.create(&new_session("alice", 0)).await.unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.ssh_port, 2200);
        assert!(!session.agent_enabled);

        assert!(repo.get("alice").await.unwrap().is_some());
        assert!(repo.get("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&new_session("alice", 0)).await.unwrap();
        let duplicate = repo.create(&new_session("alice", 1)).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_port_rejected() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&new_session("alice", 0)).await.unwrap();
        let clash = repo.create(&new_session("bob", 0)).await;
        assert!(clash.is_err());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&new_session("alice", 0)).await.unwrap();
        assert!(repo.delete("alice").await.unwrap());
        assert!(!repo.delete("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_running_refreshes_access_time() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        let created = repo.create(&new_session("alice", 0)).await.unwrap();
        repo.set_status("alice", SessionStatus::Stopped).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repo.mark_running("alice").await.unwrap();

        let updated = repo.get("alice").await.unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert!(updated.last_accessed_at >= created.last_accessed_at);
    }

    #[tokio::test]
    async fn test_api_key_update_leaves_absent_key_alone() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&new_session("alice", 0)).await.unwrap();
        repo.update_api_keys("alice", Some("blob-a"), None).await.unwrap();
        repo.update_api_keys("alice", None, Some("blob-o")).await.unwrap();

        let session = repo.get("alice").await.unwrap().unwrap();
        assert_eq!(session.anthropic_api_key.as_deref(), Some("blob-a"));
        assert_eq!(session.openai_api_key.as_deref(), Some("blob-o"));
    }

    #[tokio::test]
    async fn test_expired_listing() {
        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        let mut stale = new_session("old", 0);
        stale.expires_at = Some((Utc::now() - chrono::Duration::hours(1)).to_rfc3339());
        repo.create(&stale).await.unwrap();

        let mut fresh = new_session("new", 1);
        fresh.expires_at = Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339());
        repo.create(&fresh).await.unwrap();

        repo.create(&new_session("forever", 2)).await.unwrap();

        let expired = repo.expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].username, "old");
    }
}
