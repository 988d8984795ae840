//! Builder pattern for constructing a `ProviderPool` with flexible configuration.

use super::{
    http_client::{HttpClient, HttpClientConfig},
    pool::{ProviderPool, ProviderPoolConfig},
    transport::RpcTransport,
};
use crate::{
    config::{RateLimitConfig, RetryConfig},
    events::NotificationBus,
    types::EndpointConfig,
};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during provider pool construction.
#[derive(Debug, Error)]
pub enum BuilderError {
    /// HTTP client initialization failed
    #[error("Failed to initialize HTTP client: {0}")]
    HttpClientInit(String),

    /// Chain name is required but was not provided
    #[error("chain name is required but was not provided")]
    MissingChain,

    #[error("no HTTP endpoints configured for chain {0}")]
    NoEndpoints(String),
}

/// Builder for constructing a [`ProviderPool`].
///
/// # Examples
///
/// ```no_run
/// # use rpc_access_core::{types::{EndpointConfig, ProviderClass}, upstream::ProviderPoolBuilder};
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ProviderPoolBuilder::new()
///     .chain("mainnet")
///     .endpoint(EndpointConfig::http("public", "https://rpc.example.org", ProviderClass::Free))
///     .concurrency_limit(128)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ProviderPoolBuilder {
    chain: Option<String>,
    endpoints: Vec<EndpointConfig>,
    transport: Option<Arc<dyn RpcTransport>>,
    concurrency_limit: usize,
    rate_limit: RateLimitConfig,
    retry: RetryConfig,
    notifications: Option<NotificationBus>,
}

impl ProviderPoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chain: None,
            endpoints: Vec::new(),
            transport: None,
            concurrency_limit: HttpClientConfig::default().concurrent_limit,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            notifications: None,
        }
    }

    #[must_use]
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    #[must_use]
    pub fn endpoints(mut self, endpoints: impl IntoIterator<Item = EndpointConfig>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    /// Sets the transport shared by every endpoint (default: a new [`HttpClient`]).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets HTTP client concurrency limit. Ignored when a custom transport is set.
    #[must_use]
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Shares an existing notification bus (default: a private one).
    #[must_use]
    pub fn notifications(mut self, bus: NotificationBus) -> Self {
        self.notifications = Some(bus);
        self
    }

    /// Builds the `ProviderPool`.
    ///
    /// # Errors
    ///
    /// Returns `BuilderError::MissingChain` if no chain name was provided.
    /// Returns `BuilderError::NoEndpoints` if no endpoint was added.
    /// Returns `BuilderError::HttpClientInit` if HTTP client initialization fails.
    pub fn build(self) -> Result<ProviderPool, BuilderError> {
        let chain = self.chain.ok_or(BuilderError::MissingChain)?;
        if self.endpoints.is_empty() {
            return Err(BuilderError::NoEndpoints(chain));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpClient::with_config(HttpClientConfig {
                    concurrent_limit: self.concurrency_limit,
                    ..HttpClientConfig::default()
                })
                .map_err(|e| BuilderError::HttpClientInit(e.to_string()))?,
            ),
        };

        let pool = ProviderPool::new(
            &chain,
            ProviderPoolConfig { rate_limit: self.rate_limit, retry: self.retry },
            self.notifications.unwrap_or_default(),
        );
        for endpoint in self.endpoints {
            pool.add_endpoint(endpoint.with_chain(&chain), transport.clone());
        }

        Ok(pool)
    }
}

impl Default for ProviderPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
