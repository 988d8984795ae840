//! Builder pattern for constructing an `AccessRuntime` with configurable components.

use crate::{
    config::AppConfig,
    events::NotificationBus,
    upstream::{builder::BuilderError, transport::RpcTransport, ProviderPoolBuilder},
    websocket::WsResilienceManager,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{chain::ChainAccess, lifecycle::AccessRuntime};

/// Errors that can occur during runtime initialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// No chains configured
    #[error("No chains configured")]
    NoChains,

    #[error("Provider pool initialization failed: {0}")]
    Pool(#[from] BuilderError),
}

#[derive(Clone)]
struct RuntimeOptions {
    enable_self_healing: bool,
    enable_websocket: bool,
    shutdown_channel_capacity: usize,
    notification_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            enable_self_healing: true,
            enable_websocket: true,
            shutdown_channel_capacity: 16,
            notification_capacity: 1024,
        }
    }
}

/// Builder for constructing an [`AccessRuntime`].
///
/// # Examples
///
/// ```no_run
/// # use rpc_access_core::{config::AppConfig, runtime::AccessRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load()?;
///
/// let runtime = AccessRuntimeBuilder::new()
///     .with_config(config)
///     .disable_websocket()
///     .build()?;
///
/// let chain = runtime.chain("mainnet").ok_or("unknown chain")?;
/// let fee = chain.get_gas_price().await?;
/// runtime.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct AccessRuntimeBuilder {
    config: Option<AppConfig>,
    transport: Option<Arc<dyn RpcTransport>>,
    options: RuntimeOptions,
}

impl AccessRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { config: None, transport: None, options: RuntimeOptions::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the HTTP client shared by every pool.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Runs a self-healing monitor per chain (default: on).
    #[must_use]
    pub fn enable_self_healing(mut self) -> Self {
        self.options.enable_self_healing = true;
        self
    }

    #[must_use]
    pub fn disable_self_healing(mut self) -> Self {
        self.options.enable_self_healing = false;
        self
    }

    /// Connects `newHeads` subscriptions for chains with WebSocket endpoints (default: on).
    #[must_use]
    pub fn enable_websocket(mut self) -> Self {
        self.options.enable_websocket = true;
        self
    }

    #[must_use]
    pub fn disable_websocket(mut self) -> Self {
        self.options.enable_websocket = false;
        self
    }

    /// Sets custom shutdown channel capacity (default: 16).
    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    /// Sets the notification bus capacity (default: 1024).
    #[must_use]
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.options.notification_capacity = capacity;
        self
    }

    /// Builds the runtime and starts its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if configuration is missing or invalid, or if a pool
    /// cannot be built.
    pub fn build(self) -> Result<AccessRuntime, RuntimeError> {
        let config = self.config.ok_or_else(|| {
            RuntimeError::ConfigValidation("No configuration provided".to_string())
        })?;

        if config.chains.is_empty() {
            return Err(RuntimeError::NoChains);
        }
        config.validate().map_err(RuntimeError::ConfigValidation)?;

        info!(
            chains = config.chains.len(),
            self_healing = self.options.enable_self_healing,
            websocket = self.options.enable_websocket,
            "initializing rpc access runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);
        let notifications = NotificationBus::with_capacity(self.options.notification_capacity);

        let mut chains = Vec::with_capacity(config.chains.len());
        for chain_config in &config.chains {
            let mut pool_builder = ProviderPoolBuilder::new()
                .chain(chain_config.name.clone())
                .endpoints(chain_config.http_endpoints())
                .rate_limit(config.rate_limit.clone())
                .retry(config.retry.clone())
                .notifications(notifications.clone());
            if let Some(transport) = &self.transport {
                pool_builder = pool_builder.transport(transport.clone());
            }
            let pool = Arc::new(pool_builder.build()?);
            debug!(
                chain = %chain_config.name,
                endpoints = pool.endpoints().len(),
                "provider pool initialized"
            );

            let mut access = ChainAccess::new(pool, config.health.clone(), &config.gas_cache);
            let ws_endpoints = chain_config.ws_endpoints();
            if self.options.enable_websocket && !ws_endpoints.is_empty() {
                access = access.with_websocket(WsResilienceManager::new(
                    &chain_config.name,
                    ws_endpoints,
                    &config.websocket,
                    notifications.clone(),
                ));
                debug!(chain = %chain_config.name, "websocket manager initialized");
            }
            chains.push(Arc::new(access));
        }

        let runtime = AccessRuntime::new(
            chains,
            shutdown_tx,
            notifications,
            config,
            self.options.enable_self_healing,
        );

        info!("rpc access runtime initialization complete");
        Ok(runtime)
    }
}

impl Default for AccessRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
