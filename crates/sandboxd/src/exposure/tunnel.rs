//! cloudflared ingress routing.
//!
//! The tunnel daemon routes public hostnames to local ports based on an
//! ordered ingress list in its YAML config. Rules are matched first-to-last,
//! so session routes must sit before any wildcard or catch-all rule. Edits
//! are followed by a debounced daemon reload: bursts of session churn
//! collapse into a single restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Quiet period before a scheduled reload actually runs. Another edit inside
/// the window cancels the pending reload and starts a fresh timer.
const RELOAD_QUIET_PERIOD: Duration = Duration::from_secs(2);

/// On-disk cloudflared config. Unknown top-level keys round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRoutingConfig {
    pub tunnel: String,
    #[serde(rename = "credentials-file")]
    pub credentials_file: String,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// One ingress rule. A rule without a hostname is the catch-all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
    #[serde(
        rename = "originRequest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_request: Option<serde_yaml::Mapping>,
}

impl IngressRule {
    fn is_fallback(&self) -> bool {
        match &self.hostname {
            None => true,
            Some(h) => h.starts_with('*'),
        }
    }
}

/// Index at which a new exact-hostname rule must be inserted: before the
/// first wildcard or catch-all rule, or at the end when there is none.
pub(crate) fn insert_position(rules: &[IngressRule]) -> usize {
    rules
        .iter()
        .position(IngressRule::is_fallback)
        .unwrap_or(rules.len())
}

/// Tunnel routing abstraction for testability.
#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// Ensure a route from hostname to a local service URL exists.
    async fn add_route(&self, hostname: &str, service: &str) -> Result<()>;
    /// Remove the route for a hostname, if present.
    async fn remove_route(&self, hostname: &str) -> Result<()>;
}

enum ReloadAction {
    Command(Vec<String>),
    #[cfg(test)]
    Counter(Arc<std::sync::atomic::AtomicUsize>),
}

struct ReloaderInner {
    quiet: Duration,
    action: ReloadAction,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl ReloaderInner {
    async fn run(&self) {
        match &self.action {
            ReloadAction::Command(cmd) => {
                let Some((binary, args)) = cmd.split_first() else {
                    return;
                };
                match tokio::process::Command::new(binary).args(args).output().await {
                    Ok(out) if out.status.success() => info!("tunnel daemon reloaded"),
                    Ok(out) => error!(
                        "tunnel reload failed (exit {}): {}",
                        out.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&out.stderr).trim()
                    ),
                    Err(e) => error!("tunnel reload could not run {binary}: {e}"),
                }
            }
            #[cfg(test)]
            ReloadAction::Counter(count) => {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}

/// Debounced reload trigger. A reload failure is logged, never surfaced: the
/// config on disk is already correct and the daemon picks it up on its next
/// restart.
#[derive(Clone)]
pub struct Reloader {
    inner: Arc<ReloaderInner>,
}

impl Reloader {
    /// Reloader that runs the given command after the quiet period.
    pub fn new(command: Vec<String>) -> Self {
        Self::with_quiet(command, RELOAD_QUIET_PERIOD)
    }

    pub fn with_quiet(command: Vec<String>, quiet: Duration) -> Self {
        Self {
            inner: Arc::new(ReloaderInner {
                quiet,
                action: ReloadAction::Command(command),
                pending: Mutex::new(None),
            }),
        }
    }

    #[cfg(test)]
    fn counting(quiet: Duration) -> (Self, Arc<std::sync::atomic::AtomicUsize>) {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let reloader = Self {
            inner: Arc::new(ReloaderInner {
                quiet,
                action: ReloadAction::Counter(Arc::clone(&count)),
                pending: Mutex::new(None),
            }),
        };
        (reloader, count)
    }

    /// Schedule a reload. Cancels any reload already pending so only the
    /// last edit in a burst triggers one.
    pub async fn schedule(&self) {
        let mut slot = self.inner.pending.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.quiet).await;
            inner.run().await;
        }));
    }
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader").finish_non_exhaustive()
    }
}

/// File-backed tunnel ingress manager.
pub struct TunnelIngress {
    /// Path to the cloudflared config. `None` disables routing entirely.
    config_path: Option<PathBuf>,
    /// Serializes read-modify-write cycles on the config file.
    edit_lock: Mutex<()>,
    reloader: Reloader,
}

impl TunnelIngress {
    pub fn new(config_path: Option<PathBuf>, reloader: Reloader) -> Self {
        Self {
            config_path,
            edit_lock: Mutex::new(()),
            reloader,
        }
    }

    async fn load(&self, path: &PathBuf) -> Result<TunnelRoutingConfig> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading tunnel config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing tunnel config {}", path.display()))
    }

    async fn save(&self, path: &PathBuf, config: &TunnelRoutingConfig) -> Result<()> {
        let raw = serde_yaml::to_string(config).context("serializing tunnel config")?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("writing tunnel config {}", path.display()))
    }
}

#[async_trait]
impl TunnelApi for TunnelIngress {
    async fn add_route(&self, hostname: &str, service: &str) -> Result<()> {
        let Some(path) = &self.config_path else {
            debug!("tunnel not configured, skipping route for {hostname}");
            return Ok(());
        };

        let _guard = self.edit_lock.lock().await;
        let mut config = self.load(path).await?;

        if config
            .ingress
            .iter()
            .any(|r| r.hostname.as_deref() == Some(hostname))
        {
            debug!("tunnel route for {hostname} already present");
            return Ok(());
        }

        let rule = IngressRule {
            hostname: Some(hostname.to_string()),
            service: service.to_string(),
            origin_request: None,
        };
        let at = insert_position(&config.ingress);
        config.ingress.insert(at, rule);

        self.save(path, &config).await?;
        info!("added tunnel route {hostname} -> {service}");
        self.reloader.schedule().await;
        Ok(())
    }

    async fn remove_route(&self, hostname: &str) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };

        let _guard = self.edit_lock.lock().await;
        let mut config = self.load(path).await?;

        let before = config.ingress.len();
        config
            .ingress
            .retain(|r| r.hostname.as_deref() != Some(hostname));
        if config.ingress.len() == before {
            return Ok(());
        }

        self.save(path, &config).await?;
        info!("removed tunnel route {hostname}");
        self.reloader.schedule().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn rule(hostname: Option<&str>, service: &str) -> IngressRule {
        IngressRule {
            hostname: hostname.map(str::to_string),
            service: service.to_string(),
            origin_request: None,
        }
    }

    fn base_config() -> TunnelRoutingConfig {
        TunnelRoutingConfig {
            tunnel: "tunnel-id".to_string(),
            credentials_file: "/etc/cloudflared/creds.json".to_string(),
            ingress: vec![
                rule(Some("panel.example.com"), "http://localhost:3000"),
                rule(None, "http_status:404"),
            ],
            extra: serde_yaml::Mapping::new(),
        }
    }

    async fn write_config(dir: &tempfile::TempDir, config: &TunnelRoutingConfig) -> PathBuf {
        let path = dir.path().join("config.yml");
        tokio::fs::write(&path, serde_yaml::to_string(config).unwrap())
            .await
            .unwrap();
        path
    }

    #[test]
    fn test_insert_before_catch_all() {
        let config = base_config();
        assert_eq!(insert_position(&config.ingress), 1);
    }

    #[test]
    fn test_insert_before_wildcard() {
        let rules = vec![
            rule(Some("a.example.com"), "http://localhost:1000"),
            rule(Some("*.example.com"), "http://localhost:2000"),
            rule(None, "http_status:404"),
        ];
        assert_eq!(insert_position(&rules), 1);
    }

    #[test]
    fn test_insert_appends_without_fallback() {
        let rules = vec![rule(Some("a.example.com"), "http://localhost:1000")];
        assert_eq!(insert_position(&rules), 1);
        assert_eq!(insert_position(&[]), 0);
    }

    #[test]
    fn test_config_round_trip_preserves_extra_keys() {
        let raw = "tunnel: abc\ncredentials-file: /etc/creds.json\nlogfile: /var/log/cloudflared.log\ningress:\n- hostname: a.example.com\n  service: http://localhost:1000\n- service: http_status:404\n";
        let config: TunnelRoutingConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.ingress.len(), 2);

        let out = serde_yaml::to_string(&config).unwrap();
        assert!(out.contains("logfile: /var/log/cloudflared.log"));
        assert!(out.contains("credentials-file: /etc/creds.json"));
    }

    #[tokio::test]
    async fn test_add_route_inserts_before_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &base_config()).await;
        let (reloader, reloads) = Reloader::counting(Duration::from_millis(10));
        let tunnel = TunnelIngress::new(Some(path.clone()), reloader);

        tunnel
            .add_route("alice-ssh-sandbox.example.com", "ssh://localhost:2201")
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let config: TunnelRoutingConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(
            config.ingress[1].hostname.as_deref(),
            Some("alice-ssh-sandbox.example.com")
        );
        assert_eq!(config.ingress.last().unwrap().hostname, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_route_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &base_config()).await;
        let (reloader, reloads) = Reloader::counting(Duration::from_millis(10));
        let tunnel = TunnelIngress::new(Some(path.clone()), reloader);

        tunnel
            .add_route("alice-http-sandbox.example.com", "http://localhost:3201")
            .await
            .unwrap();
        tunnel
            .add_route("alice-http-sandbox.example.com", "http://localhost:3201")
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let config: TunnelRoutingConfig = serde_yaml::from_str(&raw).unwrap();
        let matching = config
            .ingress
            .iter()
            .filter(|r| r.hostname.as_deref() == Some("alice-http-sandbox.example.com"))
            .count();
        assert_eq!(matching, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_route_absent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &base_config()).await;
        let (reloader, reloads) = Reloader::counting(Duration::from_millis(10));
        let tunnel = TunnelIngress::new(Some(path), reloader);

        tunnel.remove_route("ghost.example.com").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_route_deletes_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config();
        config.ingress.insert(
            0,
            rule(Some("bob-ssh-sandbox.example.com"), "ssh://localhost:2202"),
        );
        let path = write_config(&dir, &config).await;
        let (reloader, _reloads) = Reloader::counting(Duration::from_millis(10));
        let tunnel = TunnelIngress::new(Some(path.clone()), reloader);

        tunnel
            .remove_route("bob-ssh-sandbox.example.com")
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let reread: TunnelRoutingConfig = serde_yaml::from_str(&raw).unwrap();
        assert!(
            reread
                .ingress
                .iter()
                .all(|r| r.hostname.as_deref() != Some("bob-ssh-sandbox.example.com"))
        );
    }

    #[tokio::test]
    async fn test_unconfigured_routes_are_noops() {
        let (reloader, reloads) = Reloader::counting(Duration::from_millis(10));
        let tunnel = TunnelIngress::new(None, reloader);

        tunnel.add_route("a.example.com", "ssh://localhost:2201").await.unwrap();
        tunnel.remove_route("a.example.com").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reload_burst_collapses_to_one() {
        let (reloader, reloads) = Reloader::counting(Duration::from_millis(40));

        reloader.schedule().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        reloader.schedule().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        reloader.schedule().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
    }
}
