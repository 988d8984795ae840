use thiserror::Error;
use tokio::time::Instant;

/// Routing-level classification of a failed call.
///
/// Transport adapters decide the kind when they build an [`UpstreamError`]; the
/// pool only ever matches on this enum:
/// - `Transient`: backoff, consume an attempt, count toward endpoint unhealthiness
/// - `RateLimited`: short cooldown, roll over to another endpoint without consuming an attempt
/// - `QuotaExhausted`: 24h quarantine, roll over without consuming an attempt
/// - `Other`: backoff and consume an attempt, endpoint is not penalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Transient,
    RateLimited,
    QuotaExhausted,
    Other,
}

impl FailureKind {
    /// Returns `true` if the failure is a routing signal rather than an endpoint fault.
    #[must_use]
    pub fn is_routing_signal(&self) -> bool {
        matches!(self, Self::RateLimited | Self::QuotaExhausted)
    }

    /// Returns a static string representation for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur when interacting with upstream RPC providers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded the configured timeout duration.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish a connection to the upstream endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP-level error occurred (non-2xx status code other than rate limiting).
    ///
    /// First field is the HTTP status code, second is the error message.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error returned by the upstream provider.
    ///
    /// First field is the RPC error code, second is the error message.
    #[error("RPC error {0}: {1}")]
    RpcError(i32, String),

    /// Response from upstream could not be parsed or was malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Provider rejected the call because of a short-horizon rate limit (429 class).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Provider rejected the call because a long-horizon quota (monthly, billing) is used up.
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// No endpoint could be selected, not even through emergency recovery.
    #[error("No healthy upstreams available")]
    NoHealthyUpstreams,

    /// Every endpoint's rate window is at capacity.
    #[error("Rate budget exhausted on every endpoint")]
    RateBudgetExhausted,

    /// The retry budget of `with_retry` was spent.
    #[error("All {attempts} attempts failed: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<UpstreamError>,
    },

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Request validation failed before being sent to upstream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Returns the routing classification of this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout |
            Self::ConnectionFailed(_) |
            Self::WebSocket(_) |
            Self::InvalidResponse(_) => FailureKind::Transient,
            Self::HttpError(status, _) if (500..=599).contains(status) => FailureKind::Transient,
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::QuotaExhausted(_) => FailureKind::QuotaExhausted,
            Self::RetriesExhausted { source, .. } => source.kind(),
            _ => FailureKind::Other,
        }
    }

    /// Returns the innermost error, unwrapping `RetriesExhausted`.
    #[must_use]
    pub fn root(&self) -> &UpstreamError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Errors raised by a single WebSocket connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WsError {
    /// The reconnect circuit is open; no network call was made.
    #[error("Circuit open until {retry_at:?}")]
    CircuitOpen { retry_at: Instant },

    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connect failed: {0}")]
    Connect(String),

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("WebSocket operation timed out")]
    Timeout,

    /// The connection was shut down by its owner and will not reconnect.
    #[error("Connection shut down")]
    ShutDown,
}

impl From<WsError> for UpstreamError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Timeout => Self::Timeout,
            other => Self::WebSocket(other.to_string()),
        }
    }
}
