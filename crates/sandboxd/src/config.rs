//! Daemon configuration.
//!
//! Loaded from a TOML file with `SANDBOXD__SECTION__KEY` environment
//! overrides layered on top.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::exposure::DnsConfig;
use crate::ports::PortRanges;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/sandboxd/sandboxd.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary, podman or docker.
    pub binary: String,
    /// Sandbox image to run.
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            image: "localhost/sandbox:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the cloudflared config. Empty disables tunnel routing.
    pub config_path: String,
    /// Command that reloads the tunnel daemon after config edits.
    pub reload_command: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            config_path: String::new(),
            reload_command: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "cloudflared".to_string(),
            ],
        }
    }
}

impl TunnelConfig {
    pub fn config_path(&self) -> Option<PathBuf> {
        if self.config_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(
                shellexpand::tilde(&self.config_path).into_owned(),
            ))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for admin session tokens.
    pub jwt_secret: String,
    /// bcrypt hash of the admin password. Generate with
    /// `sandboxd hash-password`.
    pub admin_password_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Master key for API-key encryption, at least 32 bytes.
    pub master_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub container: ContainerConfig,
    pub ports: PortRanges,
    pub dns: DnsConfig,
    pub tunnel: TunnelConfig,
    pub auth: AuthConfig,
    pub vault: VaultConfig,
    /// Public base domain sessions are exposed under.
    pub domain: String,
}

impl Config {
    /// Load configuration. Explicit path > default location > built-in
    /// defaults, with environment overrides applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                if let Some(default_path) = Self::default_path()
                    && default_path.exists()
                {
                    builder = builder.add_source(config::File::from(default_path));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SANDBOXD")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sandboxd").join("config.toml"))
    }
}
