//! Transport seam between the pool and the wire.
//!
//! The pool never inspects provider messages. Adapters implementing [`RpcTransport`]
//! turn raw HTTP statuses and JSON-RPC error objects into classified
//! [`UpstreamError`] variants using the helpers in this module.

use crate::{
    types::{EndpointConfig, JsonRpcError, JsonRpcResponse},
    upstream::errors::{FailureKind, UpstreamError},
};
use async_trait::async_trait;
use serde_json::Value;

/// Issues a single JSON-RPC call against one endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Sends `method` with `params` and returns the `result` member.
    ///
    /// # Errors
    ///
    /// Returns a classified [`UpstreamError`]; timeouts map to [`UpstreamError::Timeout`].
    async fn call(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: Value,
    ) -> Result<Value, UpstreamError>;
}

const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "monthly",
    "billing",
    "capacity limit",
    "plan limit",
    "upgrade your plan",
    "out of credits",
    "compute units",
];

const RATE_LIMIT_PATTERNS: &[&str] =
    &["rate limit", "rate-limit", "ratelimit", "too many requests", "limit exceeded", "throttl"];

/// Classifies a provider message into a routing category.
///
/// Quota patterns win over rate-limit patterns since quota messages routinely
/// mention "limit" too.
#[must_use]
pub fn classify_message(code: Option<i32>, message: &str) -> Option<FailureKind> {
    let lower = message.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(FailureKind::QuotaExhausted);
    }
    if code == Some(-32005) || code == Some(429) || RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
    {
        return Some(FailureKind::RateLimited);
    }
    None
}

/// Builds the error for a non-success HTTP status.
#[must_use]
pub fn classify_http_status(status: u16, body: String) -> UpstreamError {
    match classify_message(None, &body) {
        Some(FailureKind::QuotaExhausted) => UpstreamError::QuotaExhausted(body),
        _ if status == 429 => UpstreamError::RateLimited(body),
        Some(FailureKind::RateLimited) => UpstreamError::RateLimited(body),
        _ => UpstreamError::HttpError(status, body),
    }
}

/// Builds the error for a JSON-RPC error object.
#[must_use]
pub fn classify_rpc_error(error: JsonRpcError) -> UpstreamError {
    match classify_message(Some(error.code), &error.message) {
        Some(FailureKind::QuotaExhausted) => UpstreamError::QuotaExhausted(error.message),
        Some(FailureKind::RateLimited) => UpstreamError::RateLimited(error.message),
        // -32603 internal error and -32000 header-not-found style faults are the node's problem.
        _ if error.code == -32603 || is_node_fault(&error.message) => {
            UpstreamError::HttpError(503, error.message)
        }
        _ => UpstreamError::RpcError(error.code, error.message),
    }
}

fn is_node_fault(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["header not found", "internal error", "service unavailable", "timeout"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Extracts `result` from a JSON-RPC response body.
///
/// # Errors
///
/// Returns a classified error for JSON-RPC error objects and
/// [`UpstreamError::InvalidResponse`] for bodies that are not JSON-RPC.
pub fn decode_response(body: &[u8]) -> Result<Value, UpstreamError> {
    let response: JsonRpcResponse = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::InvalidResponse(format!("malformed JSON-RPC body: {e}")))?;

    if let Some(error) = response.error {
        return Err(classify_rpc_error(error));
    }

    response
        .result
        .ok_or_else(|| UpstreamError::InvalidResponse("response has neither result nor error".into()))
}
