//! Application configuration structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Backing key-value store connection configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cache-aside behavior configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Connection supervisor configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppMetadata::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Application version.
    #[serde(default = "default_app_version")]
    pub version: String,
    /// Environment (development, staging, production).
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
            environment: default_environment(),
        }
    }
}

fn default_app_name() -> String {
    "strata".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Key-value store connection configuration.
///
/// Host, port and credential are supplied externally; the URL is assembled
/// here rather than taken verbatim so credentials stay a separate field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host.
    #[serde(default = "default_store_host")]
    pub host: String,

    /// Store port.
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Optional store credential.
    #[serde(default)]
    pub password: Option<String>,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix applied to every cache key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            password: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    /// Assembles the store connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }

    /// Connection timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "strata".to_string()
}

/// Cache-aside behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for cached entries, in seconds. Must be > 0.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Upper bound for a single lookup or producer invocation, in
    /// milliseconds. `0` disables the bound.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// De-duplicate concurrent misses on the same key.
    #[serde(default)]
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            operation_timeout_ms: default_operation_timeout(),
            single_flight: false,
        }
    }
}

impl CacheConfig {
    /// Default TTL as a `Duration`.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Operation timeout as a `Duration`, `None` when disabled.
    pub fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.operation_timeout_ms))
        }
    }
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_operation_timeout() -> u64 {
    5_000
}

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// Fixed delay between attempts.
    Fixed,
    /// Exponentially growing delay, capped at four times the base delay.
    Exponential,
}

impl fmt::Display for BackoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffMode::Fixed => write!(f, "fixed"),
            BackoffMode::Exponential => write!(f, "exponential"),
        }
    }
}

/// Connection supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Reconnect attempts allowed after the initial failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Delay policy between attempts.
    #[serde(default = "default_backoff")]
    pub backoff: BackoffMode,

    /// Grace period for draining in-flight operations on shutdown, in
    /// seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            backoff: default_backoff(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    /// Retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Shutdown grace period as a `Duration`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_backoff() -> BackoffMode {
    BackoffMode::Fixed
}

fn default_shutdown_grace() -> u64 {
    10
}
