//! Client configuration at `~/.trelay/client.toml`.
//!
//! Holds the default relay server, TLS trust settings and request fields
//! that rarely change between invocations. CLI flags always override
//! config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection and request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Relay server host (empty = none).
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// CA certificate used to verify the server (PEM).
    #[serde(default)]
    pub ca: Option<String>,

    /// Skip certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Platform tag sent with every request.
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub domain: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: default_port(),
            ca: None,
            insecure: false,
            platform: default_platform(),
            domain: String::new(),
        }
    }
}

fn default_port() -> u16 {
    44276
}

fn default_platform() -> String {
    "IOS".to_string()
}

/// `~/.trelay/client.toml`
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".trelay")
        .join("client.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
