//! Core type definitions shared by the HTTP pool and the WebSocket layer.
//!
//! # Type Categories
//!
//! ## Endpoint Identity
//! - [`EndpointConfig`], [`TransportKind`], [`ProviderClass`]: immutable endpoint description
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: envelopes used by the transports
//!
//! ## Payloads Delivered To Callers
//! - [`BlockEvent`]: a `newHeads` notification
//! - [`FeeData`]: current gas/fee values

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, sync::Arc};

pub const JSONRPC_VERSION: &str = "2.0";

/// Transport an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Ws,
}

/// Provider identity used for prioritization.
///
/// Free endpoints are preferred during selection so that paid quota is kept as headroom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    /// Paid or keyed provider with a monthly/billing quota.
    QuotaLimited,
    /// Public or free-tier provider.
    #[default]
    Free,
}

impl ProviderClass {
    #[must_use]
    pub fn is_quota_limited(&self) -> bool {
        matches!(self, Self::QuotaLimited)
    }
}

/// One configured remote node address. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: Arc<str>,
    pub url: String,
    pub chain: Arc<str>,
    pub transport: TransportKind,
    pub class: ProviderClass,
    pub timeout_seconds: u64,
    /// Per-endpoint ceiling overriding the pool default.
    pub requests_per_minute: Option<u32>,
}

impl EndpointConfig {
    /// Creates an HTTP endpoint description with default timeout and no per-endpoint ceiling.
    #[must_use]
    pub fn http(name: &str, url: impl Into<String>, class: ProviderClass) -> Self {
        Self {
            name: Arc::from(name),
            url: url.into(),
            chain: Arc::from("default"),
            transport: TransportKind::Http,
            class,
            timeout_seconds: 10,
            requests_per_minute: None,
        }
    }

    #[must_use]
    pub fn with_chain(mut self, chain: &str) -> Self {
        self.chain = Arc::from(chain);
        self
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }
}

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    pub params: serde_json::Value,
    pub id: u64,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self { jsonrpc: Cow::Borrowed(JSONRPC_VERSION), method: method.into(), params, id }
    }
}

/// JSON-RPC 2.0 response structure.
///
/// Contains either a `result` or an `error`. Notifications pushed over a subscription carry
/// `method`/`params` instead and have no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A new chain head observed on a block subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub chain: Arc<str>,
    pub number: u64,
    pub hash: String,
    /// Name of the connection that delivered the head.
    pub source: Arc<str>,
}

/// Current fee data.
///
/// Values are in wei. EIP-1559 fields are `None` on chains that do not expose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeData {
    pub gas_price: u128,
    pub max_priority_fee_per_gas: Option<u128>,
}

/// Parses a `0x`-prefixed hex quantity.
#[must_use]
pub fn parse_hex_quantity(value: &str) -> Option<u128> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}
