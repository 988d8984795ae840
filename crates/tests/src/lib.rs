//! Integration Tests for the RPC Access Layer
//!
//! This crate contains various test modules:
//!
//! - `pool_failover_tests`: Rollover, cooldowns, quota quarantine and self-healing over HTTP
//! - `websocket_resilience_tests`: Heartbeats, reconnects, circuit breaker and failover
//! - `runtime_tests`: Runtime assembly, gas price coalescing and shutdown
//! - `config_tests`: File loading and environment overrides
//! - `mock_infrastructure`: Reusable mock types for testing (WebSocket, RPC)
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```
//!
//! Every test runs against local mock servers; no network access or API keys are needed.


#[cfg(test)]
mod websocket_resilience_tests;

#[cfg(test)]
mod runtime_tests;
