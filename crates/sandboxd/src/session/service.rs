//! Session lifecycle orchestration.
//!
//! Provisioning runs in a fixed order: ports, container, DNS, tunnel, then
//! the database row. DNS and tunnel steps are best-effort; a session without
//! them still works over raw IP and port. An unexpected fault after the
//! container exists unwinds everything in reverse before the error is
//! returned to the caller.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use thiserror::Error;

use crate::container::{ContainerDriver, ContainerStats, DriverError, PortMapping, SandboxSpec};
use crate::exposure::{DnsApi, HTTP_PREFIX, RecordOutcome, SSH_PREFIX, TunnelApi, exposure_hostname};
use crate::ports::{PortAllocator, PortError};

use super::models::{NewSession, Session};
use super::repository::SessionRepository;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("no free port offsets left in the configured range")]
    Capacity,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PortError> for SessionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Exhausted => SessionError::Capacity,
            PortError::Internal(e) => SessionError::Internal(e),
        }
    }
}

/// Parameters for creating a session. Username and password are validated at
/// the API boundary before this struct is built.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub username: String,
    pub password: String,
    pub memory_limit: Option<i64>,
    pub cpu_limit: Option<f64>,
    pub ttl_hours: Option<i64>,
}

const DEFAULT_MEMORY_LIMIT_MB: i64 = 256;
const DEFAULT_CPU_LIMIT: f64 = 0.5;

/// DNS records and tunnel routes actually created during provisioning, kept
/// so rollback only compensates for what exists.
#[derive(Debug, Default)]
struct ExposureState {
    dns_records: Vec<String>,
    routes: Vec<String>,
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}

/// Orchestrates session provisioning and teardown.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    allocator: PortAllocator,
    driver: Arc<dyn ContainerDriver>,
    dns: Arc<dyn DnsApi>,
    tunnel: Arc<dyn TunnelApi>,
    domain: String,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        allocator: PortAllocator,
        driver: Arc<dyn ContainerDriver>,
        dns: Arc<dyn DnsApi>,
        tunnel: Arc<dyn TunnelApi>,
        domain: String,
    ) -> Self {
        Self {
            repo,
            allocator,
            driver,
            dns,
            tunnel,
            domain,
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    /// Provision a new sandbox session.
    pub async fn create(&self, params: CreateSessionParams) -> Result<Session, SessionError> {
        if self.repo.get(&params.username).await?.is_some() {
            return Err(SessionError::Conflict(format!(
                "a session for '{}' already exists",
                params.username
            )));
        }

        let ports = self.allocator.allocate().await?;

        let password_hash = bcrypt::hash(&params.password, bcrypt::DEFAULT_COST)
            .context("hashing sandbox password")?;

        let container_name = format!("sandbox-{}", params.username);
        let memory_limit = params.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT_MB);
        let cpu_limit = params.cpu_limit.unwrap_or(DEFAULT_CPU_LIMIT);

        let spec = SandboxSpec {
            name: container_name.clone(),
            username: params.username.clone(),
            password: params.password.clone(),
            ports,
            memory_limit_mb: memory_limit.max(0) as u64,
            cpu_limit,
        };
        // Nothing to unwind yet: a failed container create touched nothing.
        self.driver.create(&spec).await?;

        let exposure = self.expose(&params.username, &ports).await;

        let expires_at = params
            .ttl_hours
            .filter(|hours| *hours > 0)
            .map(|hours| (Utc::now() + chrono::Duration::hours(hours)).to_rfc3339());

        let new = NewSession {
            username: params.username.clone(),
            password_hash,
            subdomain: exposure_hostname(&self.domain, &params.username, HTTP_PREFIX),
            ports,
            container_name: container_name.clone(),
            memory_limit,
            cpu_limit,
            expires_at,
        };

        match self.repo.create(&new).await {
            Ok(session) => {
                info!(
                    "created session {} (ssh={} http={} agent={})",
                    session.username, ports.ssh, ports.http, ports.agent
                );
                Ok(session)
            }
            Err(e) => {
                self.unwind(&container_name, &exposure).await;
                if is_unique_violation(&e) {
                    Err(SessionError::Conflict(
                        "session conflicts with existing exposure resources".to_string(),
                    ))
                } else {
                    Err(SessionError::Internal(e))
                }
            }
        }
    }

    /// Tear down a session. The container goes first, and a failed removal
    /// aborts the delete so the row keeps describing the still-live
    /// container and the operation can be retried. Exposure cleanup is
    /// best-effort.
    pub async fn delete(&self, username: &str) -> Result<(), SessionError> {
        let session = self
            .repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)?;

        self.driver.remove(&session.container_name).await?;

        for prefix in [SSH_PREFIX, HTTP_PREFIX] {
            let hostname = exposure_hostname(&self.domain, username, prefix);
            if let Err(e) = self.tunnel.remove_route(&hostname).await {
                warn!("tunnel route {hostname} not removed: {e:#}");
            }
            match self.dns.find_record(&hostname).await {
                Ok(Some(record_id)) => {
                    if let Err(e) = self.dns.delete_record(&record_id).await {
                        warn!("dns record {record_id} for {hostname} not deleted: {e:#}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("dns lookup for {hostname} failed: {e:#}"),
            }
        }

        self.repo.delete(username).await?;
        info!("deleted session {username}");
        Ok(())
    }

    /// Restart the session's container and mark the row running.
    pub async fn restart(&self, username: &str) -> Result<Session, SessionError> {
        let session = self
            .repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)?;

        self.driver.restart(&session.container_name).await?;
        self.repo.mark_running(username).await?;

        self.repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)
    }

    pub async fn stats(&self, username: &str) -> Result<ContainerStats, SessionError> {
        let session = self
            .repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)?;
        Ok(self.driver.stats(&session.container_name).await?)
    }

    /// Live container state for a session.
    pub async fn status(&self, username: &str) -> Result<String, SessionError> {
        let session = self
            .repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)?;
        Ok(self.driver.status(&session.container_name).await)
    }

    pub async fn get(&self, username: &str) -> Result<Session, SessionError> {
        self.repo
            .get(username)
            .await?
            .ok_or(SessionError::NotFound)
    }

    pub async fn list(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.repo.list().await?)
    }

    /// Tear down every session whose expiry has passed. Returns how many
    /// were removed; individual failures are logged and skipped.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.repo.expired().await?;
        let mut removed = 0;
        for session in expired {
            info!("session {} expired, tearing down", session.username);
            match self.delete(&session.username).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("expired session {} not removed: {e}", session.username),
            }
        }
        Ok(removed)
    }

    /// Create DNS records and tunnel routes for the SSH and HTTP services.
    /// Failures are logged; whatever succeeded is recorded for rollback.
    async fn expose(&self, username: &str, ports: &PortMapping) -> ExposureState {
        let mut state = ExposureState::default();
        let targets = [
            (SSH_PREFIX, "ssh", ports.ssh),
            (HTTP_PREFIX, "http", ports.http),
        ];

        for (prefix, scheme, port) in targets {
            let hostname = exposure_hostname(&self.domain, username, prefix);

            match self.dns.create_record(&hostname).await {
                Ok(RecordOutcome::Created(record_id)) => state.dns_records.push(record_id),
                Ok(RecordOutcome::Skipped) => {}
                Err(e) => warn!("dns record for {hostname} not created: {e:#}"),
            }

            let service = format!("{scheme}://localhost:{port}");
            match self.tunnel.add_route(&hostname, &service).await {
                Ok(()) => state.routes.push(hostname),
                Err(e) => warn!("tunnel route for {hostname} not added: {e:#}"),
            }
        }

        state
    }

    /// Compensate for a failed create, in reverse provisioning order.
    /// Cleanup failures are logged so they never mask the root cause.
    async fn unwind(&self, container_name: &str, exposure: &ExposureState) {
        warn!("session create failed, rolling back {container_name}");

        for hostname in exposure.routes.iter().rev() {
            if let Err(e) = self.tunnel.remove_route(hostname).await {
                warn!("rollback: tunnel route {hostname} not removed: {e:#}");
            }
        }
        for record_id in exposure.dns_records.iter().rev() {
            if let Err(e) = self.dns.delete_record(record_id).await {
                warn!("rollback: dns record {record_id} not deleted: {e:#}");
            }
        }
        if let Err(e) = self.driver.remove(container_name).await {
            warn!("rollback: container {container_name} not removed: {e}");
        }
    }
}
