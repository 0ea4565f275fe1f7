//! Configuration management for the scanner service.
//!
//! Loads settings from a TOML file plus environment variables, validates
//! them, and exposes the active configuration as an atomically swappable
//! snapshot so a reload never leaves readers with a half-updated view.

mod watcher;

pub use watcher::ConfigWatcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Main service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Worker pool and timeout settings
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Historical-data cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Data provider selection and credentials
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Log level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the scan/fetch API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum number of in-flight per-symbol fetches
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-symbol fetch timeout in milliseconds
    #[serde(default = "default_symbol_timeout_ms")]
    pub symbol_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether fetched series are cached at all
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Time-to-live for a cached series in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval between sweeps that purge expired entries, in seconds
    #[serde(default = "default_cache_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

/// Which concrete data provider backs the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Deterministic generated bars, no network
    Mock,
    /// Alpaca Market Data v2 daily bars
    Alpaca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider selector
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    /// Vendor API key
    #[serde(default)]
    pub api_key: String,
    /// Vendor API secret
    #[serde(default)]
    pub api_secret: String,
    /// Vendor data endpoint base URL
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Artificial latency for the mock provider, in milliseconds
    #[serde(default)]
    pub mock_latency_ms: u64,
}

// Default value functions

fn default_bind_address() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_max_concurrency() -> usize {
    50
}

fn default_symbol_timeout_ms() -> u64 {
    5_000
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_cleanup_secs() -> u64 {
    60
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Mock
}

fn default_provider_base_url() -> String {
    "https://data.alpaca.markets".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment variables and the default
    /// `scanner.toml` file if one is present in the working directory.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("scanner").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SCANNER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load configuration from an explicit file path, layered with
    /// environment variables. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(config::Environment::default().separator("__").prefix("SCANNER"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scanner.max_concurrency > 0,
            "scanner.max_concurrency must be greater than zero"
        );

        anyhow::ensure!(
            self.scanner.symbol_timeout_ms > 0,
            "scanner.symbol_timeout_ms must be greater than zero"
        );

        anyhow::ensure!(
            !self.cache.enabled || self.cache.ttl_secs > 0,
            "cache.ttl_secs must be greater than zero when the cache is enabled"
        );

        anyhow::ensure!(
            !self.server.bind_address.is_empty(),
            "server.bind_address must not be empty"
        );

        anyhow::ensure!(
            matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error"),
            "log_level must be one of debug, info, warn, error"
        );

        if self.provider.kind == ProviderKind::Alpaca {
            anyhow::ensure!(
                !self.provider.api_key.is_empty() && !self.provider.api_secret.is_empty(),
                "provider.api_key and provider.api_secret are required for the alpaca provider"
            );
        }

        Ok(())
    }

    /// Per-symbol fetch timeout as a [`Duration`].
    pub fn symbol_timeout(&self) -> Duration {
        Duration::from_millis(self.scanner.symbol_timeout_ms)
    }

    /// Cache entry time-to-live as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Cache sweep interval as a [`Duration`].
    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scanner: ScannerConfig::default(),
            cache: CacheConfig::default(),
            provider: ProviderConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            symbol_timeout_ms: default_symbol_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_cache_ttl_secs(),
            cleanup_interval_secs: default_cache_cleanup_secs(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_provider_base_url(),
            mock_latency_ms: 0,
        }
    }
}

/// Atomically swappable holder for the active configuration.
///
/// Readers take a cheap `Arc` clone of the current snapshot; a reload swaps
/// the whole snapshot in one step, so a reader never observes a partially
/// updated configuration. Components that need config access get a clone of
/// this handle injected rather than reaching into global state.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the active snapshot, returning the previous one.
    pub fn swap(&self, config: Config) -> Arc<Config> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut guard, Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values_match_service_defaults() {
        let config = Config::default();
        assert_eq!(config.scanner.max_concurrency, 50);
        assert_eq!(config.symbol_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache_cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.server.bind_address, "0.0.0.0:50051");
        assert_eq!(config.provider.kind, ProviderKind::Mock);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.scanner.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_alpaca_requires_credentials() {
        let mut config = Config::default();
        config.provider.kind = ProviderKind::Alpaca;
        assert!(config.validate().is_err());

        config.provider.api_key = "key".to_string();
        config.provider.api_secret = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = Config::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join("spread-scanner-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scanner.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[scanner]
max_concurrency = 4
symbol_timeout_ms = 250

[cache]
ttl_secs = 30
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.scanner.max_concurrency, 4);
        assert_eq!(config.symbol_timeout(), Duration::from_millis(250));
        assert_eq!(config.cache.ttl_secs, 30);
        // Unspecified sections fall back to defaults
        assert_eq!(config.cache.cleanup_interval_secs, 60);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_handle_swap_is_atomic_snapshot() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.current();

        let mut updated = Config::default();
        updated.scanner.max_concurrency = 8;
        let old = handle.swap(updated);

        assert_eq!(old.scanner.max_concurrency, 50);
        // The snapshot taken before the swap is unchanged
        assert_eq!(before.scanner.max_concurrency, 50);
        assert_eq!(handle.current().scanner.max_concurrency, 8);
    }
}
