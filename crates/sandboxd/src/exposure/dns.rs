//! Cloudflare DNS records for sandbox hostnames.
//!
//! Each exposed session service gets a proxied CNAME pointing at the tunnel
//! endpoint. When the Cloudflare credentials are not configured the client
//! degrades to a no-op and reports every record as skipped.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare credentials and zone settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// API token with DNS edit rights on the zone.
    #[serde(default)]
    pub api_token: String,
    /// Zone identifier the records live in.
    #[serde(default)]
    pub zone_id: String,
    /// Tunnel identifier; records point at `<tunnel_id>.cfargotunnel.com`.
    #[serde(default)]
    pub tunnel_id: String,
}

impl DnsConfig {
    /// Whether enough settings are present to talk to the API.
    pub fn is_configured(&self) -> bool {
        !self.api_token.is_empty() && !self.zone_id.is_empty() && !self.tunnel_id.is_empty()
    }
}

/// Result of a record creation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Record exists; carries the Cloudflare record id.
    Created(String),
    /// DNS is not configured; nothing was done.
    Skipped,
}

/// DNS provider abstraction for testability.
#[async_trait]
pub trait DnsApi: Send + Sync {
    /// Ensure a CNAME for the hostname exists, pointing at the tunnel.
    async fn create_record(&self, hostname: &str) -> Result<RecordOutcome>;
    /// Look up the record id for a hostname, if one exists.
    async fn find_record(&self, hostname: &str) -> Result<Option<String>>;
    /// Delete a record by id.
    async fn delete_record(&self, record_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct CfEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CfError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CfError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
}

fn describe_errors(errors: &[CfError]) -> String {
    if errors.is_empty() {
        return "unknown error".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} (code {})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cloudflare-backed DNS client.
#[derive(Debug, Clone)]
pub struct CloudflareDns {
    config: DnsConfig,
    client: reqwest::Client,
}

impl CloudflareDns {
    pub fn new(config: DnsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn records_url(&self) -> String {
        format!("{API_BASE}/zones/{}/dns_records", self.config.zone_id)
    }
}

#[async_trait]
impl DnsApi for CloudflareDns {
    async fn create_record(&self, hostname: &str) -> Result<RecordOutcome> {
        if !self.config.is_configured() {
            debug!("dns not configured, skipping record for {hostname}");
            return Ok(RecordOutcome::Skipped);
        }

        if let Some(id) = self.find_record(hostname).await? {
            debug!("dns record for {hostname} already exists");
            return Ok(RecordOutcome::Created(id));
        }

        let body = json!({
            "type": "CNAME",
            "name": hostname,
            "content": format!("{}.cfargotunnel.com", self.config.tunnel_id),
            "ttl": 1,
            "proxied": true,
        });

        let envelope: CfEnvelope<CfRecord> = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await
            .context("sending dns record creation request")?
            .json()
            .await
            .context("decoding dns record creation response")?;

        if !envelope.success {
            bail!(
                "creating dns record for {hostname}: {}",
                describe_errors(&envelope.errors)
            );
        }

        let record = envelope
            .result
            .context("dns record creation succeeded without a record body")?;
        info!("created dns record {} for {hostname}", record.id);
        Ok(RecordOutcome::Created(record.id))
    }

    async fn find_record(&self, hostname: &str) -> Result<Option<String>> {
        if !self.config.is_configured() {
            return Ok(None);
        }

        let envelope: CfEnvelope<Vec<CfRecord>> = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.config.api_token)
            .query(&[("type", "CNAME"), ("name", hostname)])
            .send()
            .await
            .context("sending dns record lookup request")?
            .json()
            .await
            .context("decoding dns record lookup response")?;

        if !envelope.success {
            bail!(
                "looking up dns record for {hostname}: {}",
                describe_errors(&envelope.errors)
            );
        }

        Ok(envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|r| r.id))
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        if !self.config.is_configured() {
            return Ok(());
        }

        let envelope: CfEnvelope<serde_json::Value> = self
            .client
            .delete(format!("{}/{record_id}", self.records_url()))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .context("sending dns record deletion request")?
            .json()
            .await
            .context("decoding dns record deletion response")?;

        if !envelope.success {
            bail!(
                "deleting dns record {record_id}: {}",
                describe_errors(&envelope.errors)
            );
        }

        info!("deleted dns record {record_id}");
        Ok(())
    }
}
