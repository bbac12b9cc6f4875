//! Database module for session and task persistence.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::warn;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

/// Locks held longer than this are assumed to belong to a crashed holder and
/// are reclaimed by the next acquirer.
const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// How long to wait between acquisition attempts.
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A held named advisory lock.
///
/// The lock is cooperative: it serializes holders across every process that
/// shares the store, but protects nothing by itself. Callers must release it
/// on every path; a guard dropped without release is reclaimed by the stale
/// sweep after [`STALE_LOCK_AFTER`].
#[must_use = "an unreleased advisory lock blocks other holders until the stale sweep"]
pub struct AdvisoryLock {
    pool: SqlitePool,
    name: String,
    holder: String,
    released: bool,
}

impl AdvisoryLock {
    /// Block until the named lock is acquired.
    pub async fn acquire(pool: &SqlitePool, name: &str) -> Result<Self> {
        let holder = Uuid::new_v4().to_string();

        loop {
            let stale_cutoff = (Utc::now()
                - chrono::Duration::from_std(STALE_LOCK_AFTER).expect("constant fits"))
            .to_rfc3339();

            sqlx::query("DELETE FROM advisory_locks WHERE name = ? AND acquired_at < ?")
                .bind(name)
                .bind(&stale_cutoff)
                .execute(pool)
                .await
                .context("sweeping stale advisory locks")?;

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO advisory_locks (name, holder, acquired_at) VALUES (?, ?, ?)",
            )
            .bind(name)
            .bind(&holder)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await
            .context("acquiring advisory lock")?;

            if inserted.rows_affected() == 1 {
                return Ok(Self {
                    pool: pool.clone(),
                    name: name.to_string(),
                    holder,
                    released: false,
                });
            }

            tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
        }
    }

    /// Release the lock. Errors are reported but the guard is consumed either
    /// way; the stale sweep backstops a failed delete.
    pub async fn release(mut self) {
        self.released = true;
        let result = sqlx::query("DELETE FROM advisory_locks WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await;

        if let Err(e) = result {
            warn!("failed to release advisory lock {}: {}", self.name, e);
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "advisory lock {} dropped without release; will be reclaimed as stale",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_advisory_lock_excludes_second_holder() {
        let db = Database::in_memory().await.unwrap();

        let lock = AdvisoryLock::acquire(db.pool(), "test-lock").await.unwrap();

        // A second acquire must not succeed while the first is held.
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            AdvisoryLock::acquire(db.pool(), "test-lock"),
        )
        .await;
        assert!(second.is_err(), "second holder acquired a held lock");

        lock.release().await;

        let reacquired = AdvisoryLock::acquire(db.pool(), "test-lock").await.unwrap();
        reacquired.release().await;
    }

    #[tokio::test]
    async fn test_advisory_lock_different_names_independent() {
        let db = Database::in_memory().await.unwrap();

        let a = AdvisoryLock::acquire(db.pool(), "lock-a").await.unwrap();
        let b = AdvisoryLock::acquire(db.pool(), "lock-b").await.unwrap();

        a.release().await;
        b.release().await;
    }
}
