//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. The path given with `--config`
//! 2. `$MAILCATCH_CONFIG` (environment variable)
//! 3. `~/.config/mailcatch/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailcatch\config.toml` (Windows)
//! 4. Built-in defaults

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub general: GeneralConfig,
    /// SMTP listener.
    pub smtp: SmtpConfig,
    /// POP3 listener.
    pub pop3: Pop3Config,
    /// Message storage.
    pub datastore: DataStoreConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Also write logs to `mailcatch.log` in this directory.
    pub log_dir: Option<PathBuf>,
}

/// SMTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Listen address, e.g. "0.0.0.0:2500".
    pub address: String,
    /// Domain announced in the greeting.
    pub domain: String,
    /// Recipients in this domain are accepted but never stored.
    pub domain_no_store: Option<String>,
    pub max_recipients: usize,
    pub max_idle_seconds: u64,
    /// Largest message accepted, in bytes.
    pub max_message_bytes: u64,
    /// When false, messages are accepted and discarded.
    pub store_messages: bool,
}

/// POP3 listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pop3Config {
    pub address: String,
    pub domain: String,
    pub max_idle_seconds: u64,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    /// Root directory of the message store.
    pub path: PathBuf,
    /// Maximum messages per mailbox (0 = unlimited).
    pub mailbox_msg_cap: usize,
    /// Delete messages older than this (0 = keep forever).
    pub retention_minutes: u64,
    /// Pause between mailboxes during a retention scan.
    pub retention_sleep_millis: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:2500".to_string(),
            domain: "mailcatch.local".to_string(),
            domain_no_store: None,
            max_recipients: 100,
            max_idle_seconds: 300,
            max_message_bytes: 2 * 1024 * 1024, // 2 MB
            store_messages: true,
        }
    }
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:1100".to_string(),
            domain: "mailcatch.local".to_string(),
            max_idle_seconds: 600,
        }
    }
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailcatch"),
            mailbox_msg_cap: 500,
            retention_minutes: 240,
            retention_sleep_millis: 100,
        }
    }
}

impl SmtpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }
}

impl Pop3Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }
}

impl DataStoreConfig {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_minutes > 0).then(|| Duration::from_secs(self.retention_minutes * 60))
    }
}

impl Config {
    /// Reject settings the servers cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (section, address) in [("smtp", &self.smtp.address), ("pop3", &self.pop3.address)] {
            address.parse::<SocketAddr>().map_err(|e| {
                anyhow::anyhow!("[{section}] address '{address}' is not a socket address: {e}")
            })?;
        }
        if self.smtp.max_idle_seconds == 0 {
            anyhow::bail!("[smtp] max_idle_seconds must be greater than zero");
        }
        if self.pop3.max_idle_seconds == 0 {
            anyhow::bail!("[pop3] max_idle_seconds must be greater than zero");
        }
        if self.smtp.max_recipients == 0 {
            anyhow::bail!("[smtp] max_recipients must be greater than zero");
        }
        Ok(())
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration from `explicit` or the standard locations.
///
/// An explicitly requested file must exist and parse. A file found in a
/// standard location that fails to parse is logged and replaced by defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return read_config(path);
    }

    let Some(path) = config_file_path().filter(|p| p.exists()) else {
        return Ok(Config::default());
    };
    read_config(&path).or_else(|e| {
        tracing::warn!(error = %format_args!("{e:#}"), "Using default configuration");
        Ok(Config::default())
    })
}

fn read_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config {}", path.display()))?;
    let config = toml::from_str::<Config>(&contents)
        .with_context(|| format!("Cannot parse config {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILCATCH_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailcatch").join("config.toml"))
}

/// Return the log file path, if file logging is enabled.
pub fn log_file_path(config: &Config) -> Option<PathBuf> {
    config
        .general
        .log_dir
        .as_ref()
        .map(|dir| dir.join("mailcatch.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.smtp.address, "0.0.0.0:2500");
        assert_eq!(cfg.pop3.address, "0.0.0.0:1100");
        assert!(cfg.smtp.store_messages);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[smtp]
address = "127.0.0.1:2525"
domain_no_store = "bitbucket.local"

[datastore]
mailbox_msg_cap = 2
retention_minutes = 0
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.smtp.address, "127.0.0.1:2525");
        assert_eq!(cfg.smtp.domain_no_store.as_deref(), Some("bitbucket.local"));
        assert_eq!(cfg.datastore.mailbox_msg_cap, 2);
        assert!(cfg.datastore.retention().is_none());
        assert_eq!(cfg.smtp.max_recipients, 100);
        assert_eq!(cfg.pop3.max_idle_seconds, 600);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.pop3.address = "localhost".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.smtp.max_idle_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.smtp.max_recipients = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pop3]\nmax_idle_seconds = 5\n").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.pop3.idle_timeout(), Duration::from_secs(5));

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
