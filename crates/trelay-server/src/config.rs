//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use trelay_core::{RelayError, RelayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    /// `<PLATFORM><APPNAME>COMMAND` templates.
    #[serde(default)]
    pub commands: HashMap<String, String>,
    #[serde(default)]
    pub collector: CollectorSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default = "default_compatibility_version")]
    pub compatibility_version: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_running_platform")]
    pub running_platform: String,
    #[serde(default = "default_header_grace")]
    pub header_grace_ms: u64,
    #[serde(default = "default_patch_file")]
    pub patch_file: String,
    #[serde(default = "default_patch_refresh")]
    pub patch_refresh_secs: u64,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: default_cert_path(),
            key: default_key_path(),
            compatibility_version: default_compatibility_version(),
            request_timeout_secs: default_request_timeout(),
            running_platform: default_running_platform(),
            header_grace_ms: default_header_grace(),
            patch_file: default_patch_file(),
            patch_refresh_secs: default_patch_refresh(),
            backlog: default_backlog(),
        }
    }
}

/// `[collector]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cc_prohibited: String,
    #[serde(default)]
    pub syslog_to: String,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// `<PLATFORM>` → folder the collector drops files into. `<DOMAIN>` is
    /// replaced with the request's domain.
    #[serde(default)]
    pub tftp_folders: HashMap<String, String>,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            command: None,
            cc_prohibited: String::new(),
            syslog_to: String::new(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval(),
            tftp_folders: HashMap::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    44276
}
fn default_cert_path() -> String {
    "~/.trelay/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.trelay/key.pem".to_string()
}
fn default_compatibility_version() -> String {
    "0".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_running_platform() -> String {
    "UNIX".to_string()
}
fn default_header_grace() -> u64 {
    3000
}
fn default_patch_file() -> String {
    "PatchInterfaceDB.txt".to_string()
}
fn default_patch_refresh() -> u64 {
    60
}
fn default_backlog() -> u32 {
    10
}
fn default_poll_attempts() -> u32 {
    20
}
fn default_poll_interval() -> u64 {
    1000
}

/// CLI flags that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub compatibility_version: Option<String>,
    pub patch_file: Option<String>,
}

/// Collection job settings, resolved.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub command: Option<String>,
    pub cc_prohibited: Vec<String>,
    pub syslog_to: Vec<String>,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub tftp_folders: HashMap<String, String>,
}

impl CollectorConfig {
    pub fn is_prohibited(&self, collection_type: &str) -> bool {
        self.cc_prohibited
            .iter()
            .any(|t| t.eq_ignore_ascii_case(collection_type))
    }

    /// Drop folder for `platform` with `<DOMAIN>` filled in.
    pub fn tftp_folder(&self, platform: &str, domain: &str) -> Option<PathBuf> {
        self.tftp_folders
            .get(platform)
            .map(|folder| expand_tilde_str(&folder.replace("<DOMAIN>", domain)))
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub compatibility_version: String,
    pub request_timeout: Duration,
    pub running_platform: String,
    pub header_grace: Duration,
    pub patch_file: PathBuf,
    pub patch_refresh: Duration,
    pub backlog: u32,
    pub commands: HashMap<String, String>,
    pub collector: CollectorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides. A missing file
    /// yields defaults.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    pub fn parse(content: &str) -> RelayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Configuration(format!("config parse error: {e}")))
    }

    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let server = file.server;
        let collector = file.collector;
        let cert = overrides.cert.unwrap_or(server.cert);
        let key = overrides.key.unwrap_or(server.key);
        let patch_file = overrides.patch_file.unwrap_or(server.patch_file);

        Self {
            bind: overrides.bind.unwrap_or(server.bind),
            port: overrides.port.unwrap_or(server.port),
            cert_path: expand_tilde_str(&cert),
            key_path: expand_tilde_str(&key),
            compatibility_version: overrides
                .compatibility_version
                .unwrap_or(server.compatibility_version),
            request_timeout: Duration::from_secs(server.request_timeout_secs),
            running_platform: server.running_platform,
            header_grace: Duration::from_millis(server.header_grace_ms),
            patch_file: expand_tilde_str(&patch_file),
            patch_refresh: Duration::from_secs(server.patch_refresh_secs.max(1)),
            backlog: server.backlog,
            commands: file.commands,
            collector: CollectorConfig {
                command: collector.command.filter(|c| !c.trim().is_empty()),
                cc_prohibited: split_list(&collector.cc_prohibited),
                syslog_to: split_list(&collector.syslog_to),
                poll_attempts: collector.poll_attempts,
                poll_interval: Duration::from_millis(collector.poll_interval_ms),
                tftp_folders: collector.tftp_folders,
            },
        }
    }

    /// Command template for `<PLATFORM><APPNAME>COMMAND`.
    pub fn command_template(&self, platform: &str, app_name: &str) -> Option<&str> {
        self.commands
            .get(&format!("{platform}{app_name}COMMAND"))
            .map(String::as_str)
    }

    /// Unix traceroute prints its header on stderr.
    pub fn header_on_stderr(&self) -> bool {
        self.running_platform.eq_ignore_ascii_case("UNIX")
    }

    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
