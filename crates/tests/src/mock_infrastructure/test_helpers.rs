//! Test Helper Functions and Utilities
//!
//! Configuration fixtures tuned for tests: short timers, no jitter, no throttling.

use rpc_access_core::{
    config::{
        AppConfig, ChainConfig, HealthConfig, HttpEndpointEntry, RateLimitConfig, RetryConfig,
        WebSocketConfig,
    },
    types::ProviderClass,
};
use std::time::Duration;

/// An HTTP endpoint entry with an explicit name.
#[must_use]
pub fn http_entry(name: &str, url: &str, class: ProviderClass) -> HttpEndpointEntry {
    HttpEndpointEntry {
        url: url.to_string(),
        name: Some(name.to_string()),
        class,
        requests_per_minute: None,
        timeout_seconds: 5,
    }
}

/// A chain with the given HTTP entries and WebSocket URLs.
#[must_use]
pub fn chain_config(name: &str, http: Vec<HttpEndpointEntry>, ws: Vec<String>) -> ChainConfig {
    ChainConfig { name: name.to_string(), chain_id: 1, http, ws }
}

/// Rate budget that never gets in the way of a test.
#[must_use]
pub fn generous_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_minute: 10_000,
        global_requests_per_minute: 100_000,
        window_seconds: 60,
        min_request_spacing_ms: 0,
        admission_retry_ms: 10,
    }
}

/// Retries with millisecond backoff.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig { max_attempts: 3, base_delay_ms: 10, ..RetryConfig::default() }
}

/// WebSocket timers scaled down to tens of milliseconds, jitter disabled.
#[must_use]
pub fn fast_websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 50,
        max_missed_heartbeats: 2,
        connect_timeout_ms: 500,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        jitter_factor: 0.0,
        max_reconnect_attempts: 3,
        circuit_breaker_cooldown_ms: 60_000,
        refresh_interval_seconds: 0,
        max_connections: 3,
    }
}

/// A full configuration around the given chains with fast test timers.
#[must_use]
pub fn test_app_config(chains: Vec<ChainConfig>) -> AppConfig {
    AppConfig {
        chains,
        rate_limit: generous_rate_limit(),
        retry: fast_retry(),
        health: HealthConfig { interval_seconds: 300, min_recovery_seconds: 0, probe_timeout_ms: 500 },
        websocket: fast_websocket_config(),
        ..AppConfig::default()
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
