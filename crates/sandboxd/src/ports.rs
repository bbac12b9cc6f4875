//! Host port allocation for sandbox sessions.
//!
//! Every session owns one offset into the configured SSH range; its HTTP and
//! agent ports are derived from the same offset so a session's three ports
//! always move together. Allocation is serialized across processes through a
//! named advisory lock, then picks a random free offset so freshly deleted
//! sessions do not get their old ports handed straight back.

use std::collections::HashSet;

use anyhow::Context;
use log::debug;
use rand::seq::SliceRandom;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::container::PortMapping;
use crate::db::AdvisoryLock;

/// Lock name serializing allocations across all processes on the store.
const PORT_LOCK: &str = "port-allocation";

/// Fixed distance between a session's SSH and HTTP host ports.
const HTTP_PORT_STRIDE: u16 = 1000;

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum PortError {
    /// Every offset in the configured range is taken or unusable.
    #[error("no free port offsets left in the configured range")]
    Exhausted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Configured port ranges.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PortRanges {
    /// First SSH host port (offset 0).
    pub ssh_start: u16,
    /// Number of offsets, and therefore the maximum session count.
    pub range_size: u16,
    /// First agent host port; agent ports use the same offset as SSH.
    pub agent_start: u16,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            ssh_start: 2200,
            range_size: 100,
            agent_start: 9100,
        }
    }
}

impl PortRanges {
    /// Build the port triple for an offset. `None` when any derived port
    /// would overflow the valid port space.
    pub fn mapping_for(&self, offset: u16) -> Option<PortMapping> {
        let ssh = self.ssh_start.checked_add(offset)?;
        let http = ssh.checked_add(HTTP_PORT_STRIDE)?;
        let agent = self.agent_start.checked_add(offset)?;
        Some(PortMapping { ssh, http, agent })
    }
}

/// Offsets whose SSH port is not taken by any existing session, in range
/// order. Offsets whose derived ports would overflow are excluded.
pub fn free_offsets(ranges: &PortRanges, used_ssh: &HashSet<u16>) -> Vec<u16> {
    (0..ranges.range_size)
        .filter(|offset| {
            ranges
                .mapping_for(*offset)
                .is_some_and(|m| !used_ssh.contains(&m.ssh))
        })
        .collect()
}

/// Database-backed port allocator.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    pool: SqlitePool,
    ranges: PortRanges,
    probe_os: bool,
}

impl PortAllocator {
    pub fn new(pool: SqlitePool, ranges: PortRanges) -> Self {
        Self {
            pool,
            ranges,
            probe_os: true,
        }
    }

    /// Disable the OS-level bind probe. Used by tests that run against an
    /// in-memory store where the host's real port usage is irrelevant.
    pub fn without_os_probe(mut self) -> Self {
        self.probe_os = false;
        self
    }

    /// Allocate a port triple for a new session.
    ///
    /// The returned ports are only reserved once the caller persists the
    /// session row; callers must do so before starting another allocation.
    pub async fn allocate(&self) -> Result<PortMapping, PortError> {
        let lock = AdvisoryLock::acquire(&self.pool, PORT_LOCK)
            .await
            .map_err(PortError::Internal)?;
        let result = self.allocate_locked().await;
        lock.release().await;
        result
    }

    async fn allocate_locked(&self) -> Result<PortMapping, PortError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT ssh_port FROM sessions")
            .fetch_all(&self.pool)
            .await
            .context("loading allocated ports")?;
        let used: HashSet<u16> = rows
            .into_iter()
            .filter_map(|(port,)| u16::try_from(port).ok())
            .collect();

        let mut candidates = free_offsets(&self.ranges, &used);
        candidates.shuffle(&mut rand::rng());

        for offset in candidates {
            let mapping = self
                .ranges
                .mapping_for(offset)
                .ok_or(PortError::Exhausted)?;
            if !self.probe_os || mapping_bindable(&mapping).await {
                debug!(
                    "allocated ports ssh={} http={} agent={}",
                    mapping.ssh, mapping.http, mapping.agent
                );
                return Ok(mapping);
            }
        }

        Err(PortError::Exhausted)
    }
}

/// Whether all three host ports can currently be bound. Something outside
/// the store (another daemon, a leftover container) may hold a port even
/// though no session row claims it.
async fn mapping_bindable(mapping: &PortMapping) -> bool {
    for port in [mapping.ssh, mapping.http, mapping.agent] {
        if TcpListener::bind(("127.0.0.1", port)).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn ranges() -> PortRanges {
        PortRanges {
            ssh_start: 2200,
            range_size: 4,
            agent_start: 9100,
        }
    }

    async fn insert_session(pool: &SqlitePool, username: &str, ssh_port: u16) {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, username, password_hash, subdomain, ssh_port, http_port, agent_port, container_name, created_at, last_accessed_at)
             VALUES (?, ?, 'hash', ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(username)
        .bind(username)
        .bind(ssh_port)
        .bind(ssh_port + HTTP_PORT_STRIDE)
        .bind(9100 + (ssh_port - 2200))
        .bind(format!("sandbox-{username}"))
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn test_derived_ports_share_offset() {
        let ranges = ranges();
        let mapping = ranges.mapping_for(2).unwrap();
        assert_eq!(mapping.ssh, 2202);
        assert_eq!(mapping.http, 3202);
        assert_eq!(mapping.agent, 9102);
    }

    #[test]
    fn test_overflowing_offsets_excluded() {
        let ranges = PortRanges {
            ssh_start: u16::MAX - 2,
            range_size: 10,
            agent_start: 9100,
        };
        assert!(free_offsets(&ranges, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_free_offsets_skip_used() {
        let mut used = HashSet::new();
        used.insert(2200);
        used.insert(2202);
        assert_eq!(free_offsets(&ranges(), &used), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_allocate_avoids_existing_sessions() {
        let db = Database::in_memory().await.unwrap();
        insert_session(db.pool(), "alice", 2200).await;
        insert_session(db.pool(), "bob", 2201).await;

        let allocator = PortAllocator::new(db.pool().clone(), ranges()).without_os_probe();
        let mapping = allocator.allocate().await.unwrap();

        assert!(mapping.ssh == 2202 || mapping.ssh == 2203);
        assert_eq!(mapping.http, mapping.ssh + HTTP_PORT_STRIDE);
        assert_eq!(mapping.agent, 9100 + (mapping.ssh - 2200));
    }

    #[tokio::test]
    async fn test_allocate_exhausted() {
        let db = Database::in_memory().await.unwrap();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            insert_session(db.pool(), name, 2200 + i as u16).await;
        }

        let allocator = PortAllocator::new(db.pool().clone(), ranges()).without_os_probe();
        assert!(matches!(
            allocator.allocate().await,
            Err(PortError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn test_allocate_releases_lock() {
        let db = Database::in_memory().await.unwrap();
        let allocator = PortAllocator::new(db.pool().clone(), ranges()).without_os_probe();

        // Two back-to-back allocations deadlock if the first leaks the lock.
        allocator.allocate().await.unwrap();
        allocator.allocate().await.unwrap();
    }
}
