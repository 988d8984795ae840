//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `#[serde(default)]` values and `Default` implementations
//! 2. **Config file**: TOML file specified by `RPC_ACCESS_CONFIG` env var
//! 3. **Environment variables**: `RPC_ACCESS__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ChainConfig`]: HTTP and WebSocket endpoints per chain
//! - [`RateLimitConfig`]: per-endpoint and global request ceilings, request spacing
//! - [`RetryConfig`]: attempt count, backoff and cooldown durations
//! - [`HealthConfig`]: self-healing interval, recovery time and probe timeout
//! - [`WebSocketConfig`]: heartbeat, reconnect backoff, circuit breaker, refresh
//! - [`GasCacheConfig`]: fee cache TTLs
//! - [`LoggingConfig`]: log level and format
//!
//! # Example
//!
//! ```toml
//! [[chains]]
//! name = "ethereum"
//! chain_id = 1
//! ws = ["wss://eth.example.com/ws"]
//!
//! [[chains.http]]
//! url = "https://eth-mainnet.example.com/v2/KEY"
//! name = "keyed"
//! class = "quota_limited"
//!
//! [[chains.http]]
//! url = "https://public-node.example.org"
//!
//! [rate_limit]
//! requests_per_minute = 120
//! global_requests_per_minute = 600
//! ```

use crate::types::{EndpointConfig, ProviderClass, TransportKind};
use config::{Config, Environment, File};
pub use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

/// One HTTP endpoint entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpointEntry {
    /// Endpoint URL. Must start with `http://` or `https://`.
    pub url: String,

    /// Identifier used in logs and notifications. Derived from the URL host when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Provider identity. Defaults to `free`.
    #[serde(default)]
    pub class: ProviderClass,

    /// Per-endpoint requests-per-minute override.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,

    /// Request timeout in seconds. Defaults to `10`.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

/// Endpoints serving one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier used in logs and as the runtime lookup key.
    pub name: String,

    #[serde(default)]
    pub chain_id: u64,

    /// HTTP JSON-RPC endpoints. Cannot be empty.
    #[serde(default)]
    pub http: Vec<HttpEndpointEntry>,

    /// WebSocket endpoints for block subscriptions. Optional.
    #[serde(default)]
    pub ws: Vec<String>,
}

impl ChainConfig {
    /// Converts HTTP entries into endpoint descriptions.
    #[must_use]
    pub fn http_endpoints(&self) -> Vec<EndpointConfig> {
        self.http
            .iter()
            .enumerate()
            .map(|(index, entry)| EndpointConfig {
                name: Arc::from(
                    entry.name.clone().unwrap_or_else(|| endpoint_name(&entry.url, index)),
                ),
                url: entry.url.clone(),
                chain: Arc::from(self.name.as_str()),
                transport: TransportKind::Http,
                class: entry.class,
                timeout_seconds: entry.timeout_seconds,
                requests_per_minute: entry.requests_per_minute,
            })
            .collect()
    }

    /// Converts WebSocket URLs into endpoint descriptions.
    #[must_use]
    pub fn ws_endpoints(&self) -> Vec<EndpointConfig> {
        self.ws
            .iter()
            .enumerate()
            .map(|(index, url)| EndpointConfig {
                name: Arc::from(format!("ws:{}", endpoint_name(url, index))),
                url: url.clone(),
                chain: Arc::from(self.name.as_str()),
                transport: TransportKind::Ws,
                class: ProviderClass::Free,
                timeout_seconds: default_timeout_seconds(),
                requests_per_minute: None,
            })
            .collect()
    }
}

/// Derives a log-friendly name from a URL, falling back to the entry index.
fn endpoint_name(raw: &str, index: usize) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{h}#{index}")))
        .unwrap_or_else(|| format!("endpoint-{index}"))
}

/// Request budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default per-endpoint ceiling per window. Defaults to `300`.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Ceiling across every endpoint of a chain per window. Defaults to `1500`.
    #[serde(default = "default_global_requests_per_minute")]
    pub global_requests_per_minute: u32,

    /// Window length in seconds. Defaults to `60`.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Minimum spacing between consecutive requests in milliseconds. Defaults to `50`.
    #[serde(default = "default_min_request_spacing_ms")]
    pub min_request_spacing_ms: u64,

    /// Delay before re-trying admission when the selected endpoint is full. Defaults to `100`.
    #[serde(default = "default_admission_retry_ms")]
    pub admission_retry_ms: u64,
}

fn default_requests_per_minute() -> u32 {
    300
}

fn default_global_requests_per_minute() -> u32 {
    1500
}

fn default_window_seconds() -> u64 {
    60
}

fn default_min_request_spacing_ms() -> u64 {
    50
}

fn default_admission_retry_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            global_requests_per_minute: default_global_requests_per_minute(),
            window_seconds: default_window_seconds(),
            min_request_spacing_ms: default_min_request_spacing_ms(),
            admission_retry_ms: default_admission_retry_ms(),
        }
    }
}

/// Retry and penalty settings for `with_retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call. Defaults to `3`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff in milliseconds; attempt `n` waits `base * 2^n`. Defaults to `1000`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cooldown after a rate limit on a quota-limited provider. Defaults to `300`.
    #[serde(default = "default_quota_limited_cooldown_secs")]
    pub quota_limited_cooldown_secs: u64,

    /// Cooldown after a rate limit on a free provider. Defaults to `30`.
    #[serde(default = "default_free_cooldown_secs")]
    pub free_cooldown_secs: u64,

    /// Quarantine after quota exhaustion. Defaults to 24 hours.
    #[serde(default = "default_quota_exhausted_cooldown_secs")]
    pub quota_exhausted_cooldown_secs: u64,

    /// Consecutive transient failures before an endpoint is marked unhealthy. Defaults to `3`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_quota_limited_cooldown_secs() -> u64 {
    300
}

fn default_free_cooldown_secs() -> u64 {
    30
}

fn default_quota_exhausted_cooldown_secs() -> u64 {
    24 * 60 * 60
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            quota_limited_cooldown_secs: default_quota_limited_cooldown_secs(),
            free_cooldown_secs: default_free_cooldown_secs(),
            quota_exhausted_cooldown_secs: default_quota_exhausted_cooldown_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Self-healing monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between healing passes in seconds. Defaults to `300`.
    #[serde(default = "default_heal_interval_seconds")]
    pub interval_seconds: u64,

    /// How long an endpoint stays unhealthy before it is probed. Defaults to `60`.
    #[serde(default = "default_min_recovery_seconds")]
    pub min_recovery_seconds: u64,

    /// Probe timeout in milliseconds. Defaults to `5000`.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_heal_interval_seconds() -> u64 {
    300
}

fn default_min_recovery_seconds() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heal_interval_seconds(),
            min_recovery_seconds: default_min_recovery_seconds(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// WebSocket connection and manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Missed heartbeats tolerated before the connection is dropped. Defaults to `3`.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Symmetric jitter as a fraction of the computed delay, within `[0, 1]`. Defaults to `0.3`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Proactive reconnect interval in seconds. `0` disables it. Defaults to 30 minutes.
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,

    /// Maximum simultaneous connections per chain. Defaults to `3`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    300_000
}

fn default_refresh_interval_seconds() -> u64 {
    1800
}

fn default_max_connections() -> usize {
    3
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            refresh_interval_seconds: default_refresh_interval_seconds(),
            max_connections: default_max_connections(),
        }
    }
}

impl WebSocketConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    /// Returns the proactive refresh interval, `None` when disabled.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_seconds > 0)
            .then(|| Duration::from_secs(self.refresh_interval_seconds))
    }
}

/// Gas/fee cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasCacheConfig {
    /// Freshness window in milliseconds. Defaults to `3000`.
    #[serde(default = "default_gas_ttl_ms")]
    pub ttl_ms: u64,

    /// Age up to which a cached value is served when a refresh fails. Defaults to `60000`.
    #[serde(default = "default_gas_stale_ttl_ms")]
    pub stale_ttl_ms: u64,
}

fn default_gas_ttl_ms() -> u64 {
    3000
}

fn default_gas_stale_ttl_ms() -> u64 {
    60_000
}

impl Default for GasCacheConfig {
    fn default() -> Self {
        Self { ttl_ms: default_gas_ttl_ms(), stale_ttl_ms: default_gas_stale_ttl_ms() }
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Main application configuration.
///
/// Loaded from TOML files and environment variables. Environment overrides use the
/// `RPC_ACCESS` prefix with `__` separating nested fields, e.g.
/// `RPC_ACCESS__RETRY__MAX_ATTEMPTS=5`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub gas_cache: GasCacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("RPC_ACCESS").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml`.
    ///
    /// The path can be overridden with the `RPC_ACCESS_CONFIG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("RPC_ACCESS_CONFIG")
            .unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Looks up a chain by name.
    #[must_use]
    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn heal_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_seconds)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.chains.is_empty() {
            return Err("No chains configured".to_string());
        }

        let mut chain_names = HashSet::new();
        for chain in &self.chains {
            if !chain_names.insert(chain.name.as_str()) {
                return Err(format!("Duplicate chain name: {}", chain.name));
            }
            if chain.http.is_empty() {
                return Err(format!("No HTTP endpoints configured for chain: {}", chain.name));
            }
            // Cooldowns, rate budgets and stats are keyed by endpoint name.
            let mut endpoint_names = HashSet::new();
            for endpoint in chain.http_endpoints() {
                if !endpoint_names.insert(endpoint.name.clone()) {
                    return Err(format!(
                        "Duplicate HTTP endpoint name for chain {}: {}",
                        chain.name, endpoint.name
                    ));
                }
            }
            for entry in &chain.http {
                if !(entry.url.starts_with("http://") || entry.url.starts_with("https://")) {
                    return Err(format!(
                        "Invalid HTTP URL for chain {}: {}",
                        chain.name, entry.url
                    ));
                }
                if entry.requests_per_minute == Some(0) {
                    return Err(format!(
                        "Per-endpoint requests_per_minute must be greater than 0: {}",
                        entry.url
                    ));
                }
            }
            for ws_url in &chain.ws {
                if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
                    return Err(format!(
                        "Invalid WebSocket URL for chain {}: {}",
                        chain.name, ws_url
                    ));
                }
            }
        }

        if self.rate_limit.requests_per_minute == 0 ||
            self.rate_limit.global_requests_per_minute == 0
        {
            return Err("Request ceilings must be greater than 0".to_string());
        }

        if self.rate_limit.window_seconds == 0 {
            return Err("Rate window must be greater than 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry max_attempts must be greater than 0".to_string());
        }

        if self.retry.failure_threshold == 0 {
            return Err("Failure threshold must be greater than 0".to_string());
        }

        if self.health.interval_seconds == 0 {
            return Err("Healing interval must be greater than 0".to_string());
        }

        if self.websocket.heartbeat_interval_ms == 0 || self.websocket.heartbeat_timeout_ms == 0 {
            return Err("Heartbeat interval and timeout must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.websocket.jitter_factor) {
            return Err("Jitter factor must be within [0, 1]".to_string());
        }

        if self.websocket.max_connections == 0 {
            return Err("WebSocket max_connections must be greater than 0".to_string());
        }

        if self.gas_cache.stale_ttl_ms < self.gas_cache.ttl_ms {
            return Err("Gas cache stale TTL must not be shorter than its TTL".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
