//! Engine configuration: defaults, optional TOML file, environment override.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ExaminerError, ExaminerResult};

/// Environment variable overriding the desktop host address.
pub const HOST_ENV: &str = "FLIPPER_HOST_ADDRESS";

/// Upper bound on secure reconnect attempts.
pub const MAX_SECURE_RETRIES: u32 = 3;

/// Engine configuration shared by the outbound and server roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExaminerConfig {
    /// Desktop host the outbound role dials.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the unauthenticated bootstrap endpoint.
    #[serde(default = "default_insecure_port")]
    pub insecure_port: u16,
    /// Port of the mutually authenticated endpoint.
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    /// Listen port for the server role.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Maximum number of secure reconnect attempts, at most
    /// [`MAX_SECURE_RETRIES`].
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Fixed spacing between secure reconnect attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Bundle identifier; also the CSR common name.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_os_name")]
    pub os_name: String,
    /// Where the CSR, private key and signed device certificate live.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

impl Default for ExaminerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            insecure_port: default_insecure_port(),
            secure_port: default_secure_port(),
            server_port: default_server_port(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            app_name: default_app_name(),
            app_id: default_app_id(),
            device_name: default_device_name(),
            os_name: default_os_name(),
            cert_dir: default_cert_dir(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_insecure_port() -> u16 {
    9089
}
fn default_secure_port() -> u16 {
    9088
}
fn default_server_port() -> u16 {
    12345
}
fn default_retry_limit() -> u32 {
    MAX_SECURE_RETRIES
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_app_name() -> String {
    "No name".to_string()
}
fn default_app_id() -> String {
    "com.example.app".to_string()
}
fn default_os_name() -> String {
    std::env::consts::OS.to_string()
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_cert_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("examiner")
        .join("certs")
}

impl ExaminerConfig {
    /// Load config from an optional TOML file, then apply the environment
    /// host override. A missing file yields defaults.
    pub fn load(config_path: Option<&Path>) -> ExaminerResult<Self> {
        let mut config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::from_toml_str(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    Self::default()
                }
            }
            None => Self::default(),
        };

        config.apply_host_override(std::env::var(HOST_ENV).ok());
        Ok(config)
    }

    /// Parse a TOML document; absent keys take their defaults.
    pub fn from_toml_str(content: &str) -> ExaminerResult<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| ExaminerError::Config(format!("config parse error: {e}")))?;
        if config.retry_limit > MAX_SECURE_RETRIES {
            return Err(ExaminerError::Config(format!(
                "retry_limit {} exceeds the maximum of {MAX_SECURE_RETRIES}",
                config.retry_limit
            )));
        }
        config.cert_dir = expand_tilde(&config.cert_dir);
        Ok(config)
    }

    /// Replace `host` with a non-empty override value.
    pub fn apply_host_override(&mut self, value: Option<String>) {
        if let Some(host) = value.filter(|h| !h.trim().is_empty()) {
            info!(host = %host, "host address overridden from environment");
            self.host = host.trim().to_string();
        }
    }

    /// Effective reconnect bound, clamped to [`MAX_SECURE_RETRIES`].
    pub fn secure_retry_limit(&self) -> u32 {
        self.retry_limit.min(MAX_SECURE_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
