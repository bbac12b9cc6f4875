//! Container runtime driver.
//!
//! Shells out to the podman (or docker) CLI to create and manage per-session
//! sandbox containers. Each sandbox exposes SSH (22), HTTP (8080) and the
//! agent runner (9090), mapped to host ports owned by the session.

mod error;

pub use error::{DriverError, DriverResult};

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;

/// In-container ports every sandbox image exposes.
const SSHD_PORT: u16 = 22;
const HTTP_PORT: u16 = 8080;
const RUNNER_PORT: u16 = 9090;

/// Pause between stop and start during a restart, so sshd releases its
/// listeners before the container comes back.
const RESTART_PAUSE: std::time::Duration = std::time::Duration::from_secs(1);

/// Host port triple assigned to one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub ssh: u16,
    pub http: u16,
    pub agent: u16,
}

/// Parameters for creating a sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name (`sandbox-<username>`).
    pub name: String,
    /// Sandbox OS user, also used as the container hostname.
    pub username: String,
    /// Initial password for the sandbox user.
    pub password: String,
    /// Host ports to map.
    pub ports: PortMapping,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU limit in cores.
    pub cpu_limit: f64,
}

/// Resource usage snapshot for a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    /// Memory usage in MiB.
    pub memory_usage: f64,
    /// CPU usage in percent.
    pub cpu_usage: f64,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Container driver abstraction for testability.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and start a sandbox container, returning the container id.
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<String>;
    /// Force-remove a container.
    async fn remove(&self, name: &str) -> DriverResult<()>;
    /// Stop a container.
    async fn stop(&self, name: &str) -> DriverResult<()>;
    /// Start a stopped container.
    async fn start(&self, name: &str) -> DriverResult<()>;
    /// Stop, pause briefly, then start.
    async fn restart(&self, name: &str) -> DriverResult<()>;
    /// Resource usage snapshot.
    async fn stats(&self, name: &str) -> DriverResult<ContainerStats>;
    /// Runtime state string ("running", "exited", ...). Returns "stopped"
    /// when inspection fails instead of raising.
    async fn status(&self, name: &str) -> String;
}

/// Validate a container name before splicing it into a CLI invocation.
fn validate_container_name(name: &str) -> DriverResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(DriverError::InvalidInput(
            "container name must be 1-128 characters".to_string(),
        ));
    }

    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(DriverError::InvalidInput(format!(
            "container name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// CLI-backed container driver.
#[derive(Debug, Clone)]
pub struct CliDriver {
    binary: String,
    image: String,
}

/// Whether the host cgroup hierarchy supports memory accounting. Probed once
/// and cached; absence downgrades the memory limit rather than failing.
static CGROUP_MEMORY: OnceCell<bool> = OnceCell::const_new();

async fn cgroup_memory_available() -> bool {
    *CGROUP_MEMORY
        .get_or_init(|| async {
            match tokio::fs::read_to_string("/sys/fs/cgroup/cgroup.controllers").await {
                Ok(controllers) => controllers.split_whitespace().any(|c| c == "memory"),
                Err(_) => false,
            }
        })
        .await
}

impl CliDriver {
    /// Create a driver for the given runtime binary and sandbox image.
    pub fn new(binary: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            image: image.into(),
        }
    }

    async fn run(&self, args: &[String]) -> DriverResult<String> {
        let command = args.first().cloned().unwrap_or_default();

        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| DriverError::Spawn {
                binary: self.binary.clone(),
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                binary: self.binary.clone(),
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerDriver for CliDriver {
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<String> {
        validate_container_name(&spec.name)?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--hostname".into(),
            spec.username.clone(),
            "--restart".into(),
            "always".into(),
            "-p".into(),
            format!("{}:{}", spec.ports.ssh, SSHD_PORT),
            "-p".into(),
            format!("{}:{}", spec.ports.http, HTTP_PORT),
            "-p".into(),
            format!("{}:{}", spec.ports.agent, RUNNER_PORT),
            "--cpus".into(),
            spec.cpu_limit.to_string(),
            "-e".into(),
            format!("SANDBOX_USER={}", spec.username),
            "-e".into(),
            format!("SANDBOX_PASSWORD={}", spec.password),
        ];

        if cgroup_memory_available().await {
            args.push("--memory".into());
            args.push(format!("{}m", spec.memory_limit_mb));
            args.push("--memory-swap".into());
            args.push(format!("{}m", spec.memory_limit_mb));
        }

        args.push(self.image.clone());

        self.run(&args).await
    }

    async fn remove(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;
        self.run(&["rm".into(), "-f".into(), name.into()]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;
        self.run(&["stop".into(), name.into()]).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> DriverResult<()> {
        validate_container_name(name)?;
        self.run(&["start".into(), name.into()]).await?;
        Ok(())
    }

    async fn restart(&self, name: &str) -> DriverResult<()> {
        self.stop(name).await?;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(name).await
    }

    async fn stats(&self, name: &str) -> DriverResult<ContainerStats> {
        validate_container_name(name)?;

        let output = self
            .run(&[
                "stats".into(),
                name.into(),
                "--no-stream".into(),
                "--format".into(),
                "{{.MemUsage}}|{{.CPUPerc}}|{{.UpTime}}".into(),
            ])
            .await?;

        Ok(parse_stats_line(&output))
    }

    async fn status(&self, name: &str) -> String {
        if validate_container_name(name).is_err() {
            return "stopped".to_string();
        }

        match self
            .run(&[
                "inspect".into(),
                name.into(),
                "--format".into(),
                "{{.State.Status}}".into(),
            ])
            .await
        {
            Ok(status) => status,
            Err(_) => "stopped".to_string(),
        }
    }
}

/// Parse a `MemUsage|CPUPerc|UpTime` snapshot line.
///
/// Fields look like "37.5MiB / 256MiB", "1.23%", "2h 15m 30s". Fragments that
/// do not parse contribute 0 instead of failing the call.
fn parse_stats_line(line: &str) -> ContainerStats {
    let mut parts = line.split('|');
    let mem = parts.next().unwrap_or("");
    let cpu = parts.next().unwrap_or("");
    let uptime = parts.next().unwrap_or("");

    ContainerStats {
        memory_usage: leading_number(mem),
        cpu_usage: leading_number(cpu),
        uptime_seconds: parse_uptime_seconds(uptime),
    }
}

/// Extract the first decimal number from a string, or 0.0.
fn leading_number(s: &str) -> f64 {
    let start = match s.find(|c: char| c.is_ascii_digit()) {
        Some(i) => i,
        None => return 0.0,
    };
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse().unwrap_or(0.0)
}

/// Parse "Xh Ym Zs" style uptimes into seconds.
fn parse_uptime_seconds(uptime: &str) -> u64 {
    let mut total: u64 = 0;
    let mut number = String::new();

    for c in uptime.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let factor = match c {
                'h' => Some(3600),
                'm' => Some(60),
                's' => Some(1),
                _ => None,
            };
            if let Some(factor) = factor
                && let Ok(n) = number.parse::<u64>()
            {
                total += n * factor;
            }
            number.clear();
        }
    }

    total
}
