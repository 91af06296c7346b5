//! Startup configuration
//!
//! Read from TOML, every field defaulted, so an empty file is a valid config.
//! A handful of deployment settings can be overridden from the environment:
//!
//! | variable                  | field                    |
//! |---------------------------|--------------------------|
//! | `KARTWALL_FEED_HOST`      | `feed.host`              |
//! | `KARTWALL_FEED_PORT`      | `feed.port`              |
//! | `KARTWALL_RETENTION_DAYS` | `capture.retention_days` |
//! | `KARTWALL_STORAGE_PATH`   | `storage.path`           |
//!
//! ```rust
//! use kartwall::config::KartwallConfig;
//!
//! let config = KartwallConfig::from_toml_str("[feed]\nhost = \"timing.local\"\n").unwrap();
//! assert_eq!(config.feed.port, 8080);
//! assert_eq!(config.feed_options().endpoint.address(), "timing.local:8080");
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::{BackoffPolicy, FeedOptions};
use crate::transport::{DEFAULT_FEED_PORT, FeedEndpoint, HANDSHAKE_TOKEN};
use crate::transports::TcpConnector;
use crate::{KartwallError, Result};

pub const ENV_FEED_HOST: &str = "KARTWALL_FEED_HOST";
pub const ENV_FEED_PORT: &str = "KARTWALL_FEED_PORT";
pub const ENV_RETENTION_DAYS: &str = "KARTWALL_RETENTION_DAYS";
pub const ENV_STORAGE_PATH: &str = "KARTWALL_STORAGE_PATH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KartwallConfig {
    pub feed: FeedConfig,
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
    pub handshake: String,
    pub base_delay_ms: u64,
    pub cap_delay_ms: u64,
    pub connect_timeout_secs: u64,
    /// Drop a link that has been silent this long. Unset keeps quiet links open.
    pub stale_timeout_secs: Option<u64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_FEED_PORT,
            handshake: HANDSHAKE_TOKEN.into(),
            base_delay_ms: 1_000,
            cap_delay_ms: 30_000,
            connect_timeout_secs: 10,
            stale_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub retention_days: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { retention_days: crate::capture::DEFAULT_RETENTION_DAYS as u32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StorageBackend::Sled, path: PathBuf::from("kartwall-data") }
    }
}

impl KartwallConfig {
    /// Load and validate a TOML file. Environment overrides are not applied.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KartwallError::config(path, e.to_string()))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| KartwallError::config(path, e.to_string()))?;
        config.validate_at(path)?;
        info!(path = %path.display(), feed = %config.feed_options().endpoint, "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| KartwallError::config("<inline>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`, then re-validate.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_FEED_HOST) {
            debug!(host = %host, "Feed host overridden from environment");
            self.feed.host = host;
        }
        if let Some(port) = lookup(ENV_FEED_PORT) {
            self.feed.port = parse_env(ENV_FEED_PORT, &port)?;
        }
        if let Some(days) = lookup(ENV_RETENTION_DAYS) {
            self.capture.retention_days = parse_env(ENV_RETENTION_DAYS, &days)?;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            self.storage.path = PathBuf::from(path);
        }
        self.validate_at(Path::new("<environment>"))
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_at(Path::new("<config>"))
    }

    fn validate_at(&self, path: &Path) -> Result<()> {
        let mut errors = Vec::new();
        if self.feed.port == 0 {
            errors.push("feed.port must be non-zero".to_string());
        }
        if self.feed.base_delay_ms == 0 {
            errors.push("feed.base_delay_ms must be non-zero".to_string());
        }
        if self.feed.cap_delay_ms < self.feed.base_delay_ms {
            errors.push(format!(
                "feed.cap_delay_ms ({}) must be at least feed.base_delay_ms ({})",
                self.feed.cap_delay_ms, self.feed.base_delay_ms
            ));
        }
        if self.feed.connect_timeout_secs == 0 {
            errors.push("feed.connect_timeout_secs must be non-zero".to_string());
        }
        if self.feed.stale_timeout_secs == Some(0) {
            errors.push("feed.stale_timeout_secs must be non-zero when set".to_string());
        }
        if self.feed.handshake.trim().is_empty() {
            errors.push("feed.handshake must not be blank".to_string());
        }
        if self.capture.retention_days == 0 {
            errors.push("capture.retention_days must be non-zero".to_string());
        }
        if self.storage.backend == StorageBackend::Sled && self.storage.path.as_os_str().is_empty() {
            errors.push("storage.path is required for the sled backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(KartwallError::config(path, errors.join("; ")))
        }
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            endpoint: FeedEndpoint::for_host(&self.feed.host, self.feed.port),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.feed.base_delay_ms),
                Duration::from_millis(self.feed.cap_delay_ms),
            ),
            handshake: self.feed.handshake.clone(),
        }
    }

    pub fn tcp_connector(&self) -> TcpConnector {
        TcpConnector::new()
            .with_connect_timeout(Duration::from_secs(self.feed.connect_timeout_secs))
            .with_stale_timeout(self.feed.stale_timeout_secs.map(Duration::from_secs))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.capture.retention_days))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| KartwallError::config(Path::new("<environment>"), format!("{name}={value:?}: {e}")))
}
