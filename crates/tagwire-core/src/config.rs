//! Configuration loading.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TagwireError};

/// Top-level tagwire configuration, read from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagwireConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Seconds a rendered page has to open its WebSocket before the pending
    /// connection is cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Fixed capacity for the per-connection queues. When unset the capacity
    /// grows with the number of elements rendered before the upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session cookie name. Defaults to a name derived from the executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_name: Option<String>,

    /// Seconds a session without connections stays alive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "tagwire_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl TagwireConfig {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| TagwireError::Config(e.to_string()))
    }

    /// Default config location: `tagwire.json5` in the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from("tagwire.json5")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        let secs = self
            .gateway
            .as_ref()
            .and_then(|g| g.request_timeout_secs)
            .unwrap_or(10);
        Duration::from_secs(secs.max(1))
    }

    pub fn queue_capacity(&self) -> Option<usize> {
        self.gateway
            .as_ref()
            .and_then(|g| g.queue_capacity)
            .map(|n| n.max(1))
    }

    pub fn cookie_name(&self) -> String {
        self.session
            .as_ref()
            .and_then(|s| s.cookie_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(default_cookie_name)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(
            self.session
                .as_ref()
                .and_then(|s| s.grace_secs)
                .unwrap_or(60),
        )
    }
}

/// Cookie name derived from the running executable, or `tagwire`.
pub fn default_cookie_name() -> String {
    let exe = std::env::current_exe().unwrap_or_default();
    make_cookie_name(&exe)
}

fn make_cookie_name(exe: &Path) -> String {
    let stem = exe
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name: String = stem.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if name.is_empty() {
        "tagwire".to_string()
    } else {
        name
    }
}
