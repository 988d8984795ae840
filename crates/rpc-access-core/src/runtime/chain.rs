//! Per-chain access facade.

use crate::{
    config::{GasCacheConfig, HealthConfig},
    events::{Notification, NotificationBus},
    gas_cache::{GasCacheError, GasCacheStats, GasPriceCache},
    types::{parse_hex_quantity, BlockEvent, FeeData},
    upstream::{
        endpoint::UpstreamEndpoint,
        errors::UpstreamError,
        health::{HealReport, SelfHealingMonitor},
        pool::{PoolStats, ProviderPool},
    },
    websocket::{ListenerId, WsConnectionStats, WsResilienceManager},
};
use serde::Serialize;
use serde_json::Value;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Point-in-time view of everything one chain is doing.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub chain: Arc<str>,
    pub pool: PoolStats,
    pub gas: GasCacheStats,
    pub websocket: Vec<WsConnectionStats>,
}

/// Everything needed to talk to one chain: the HTTP pool with its healing monitor,
/// the optional WebSocket block feed and the fee cache.
pub struct ChainAccess {
    name: Arc<str>,
    pool: Arc<ProviderPool>,
    monitor: Arc<SelfHealingMonitor>,
    websocket: Option<WsResilienceManager>,
    gas_cache: GasPriceCache,
    disconnected: AtomicBool,
}

impl ChainAccess {
    #[must_use]
    pub fn new(pool: Arc<ProviderPool>, health: HealthConfig, gas: &GasCacheConfig) -> Self {
        let monitor = Arc::new(SelfHealingMonitor::new(pool.clone(), health));
        Self {
            name: pool.chain().clone(),
            pool,
            monitor,
            websocket: None,
            gas_cache: GasPriceCache::new(gas),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Attaches a WebSocket manager. It is not started here.
    #[must_use]
    pub fn with_websocket(mut self, manager: WsResilienceManager) -> Self {
        self.websocket = Some(manager);
        self
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<SelfHealingMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn websocket(&self) -> Option<&WsResilienceManager> {
        self.websocket.as_ref()
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationBus {
        self.pool.notifications()
    }

    /// Selects an endpoint for a one-off request.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NoHealthyUpstreams`] if even emergency recovery finds nothing.
    pub fn get_provider(&self) -> Result<Arc<UpstreamEndpoint>, UpstreamError> {
        self.pool.get_provider()
    }

    /// See [`ProviderPool::with_retry`].
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RetriesExhausted`] wrapping the last underlying error.
    pub async fn with_retry<T, F, Fut>(
        &self,
        max_attempts: Option<u32>,
        operation: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut(Arc<UpstreamEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.pool.with_retry(max_attempts, operation).await
    }

    /// Sends one JSON-RPC call through [`Self::with_retry`].
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RetriesExhausted`] wrapping the last underlying error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        self.with_retry(None, |endpoint| {
            let params = params.clone();
            async move { endpoint.request(method, params).await }
        })
        .await
    }

    /// Current fee data, served from the short-lived cache when possible.
    ///
    /// # Errors
    ///
    /// Returns [`GasCacheError`] if the fetch fails and no stale value is usable.
    pub async fn get_gas_price(&self) -> Result<FeeData, GasCacheError> {
        self.gas_cache.get_or_fetch(|| self.fetch_fee_data()).await
    }

    async fn fetch_fee_data(&self) -> Result<FeeData, UpstreamError> {
        let gas_price = self.request("eth_gasPrice", Value::Array(vec![])).await?;
        let gas_price = quantity(&gas_price)?;

        // Legacy chains reject this method; the fee is still usable without it.
        let max_priority_fee_per_gas =
            match self.request("eth_maxPriorityFeePerGas", Value::Array(vec![])).await {
                Ok(value) => quantity(&value).ok(),
                Err(e) => {
                    debug!(chain = %self.name, error = %e, "priority fee unavailable");
                    None
                }
            };

        Ok(FeeData { gas_price, max_priority_fee_per_gas })
    }

    /// Seeds the fee cache, e.g. from a block header.
    pub fn inject_gas_price(&self, fee: FeeData) {
        self.gas_cache.inject(fee);
    }

    /// Registers a block callback. Returns `None` when no WebSocket endpoint is configured.
    pub fn on_block<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.websocket.as_ref().map(|manager| manager.on_block(listener))
    }

    #[must_use]
    pub fn subscribe_blocks(&self) -> Option<broadcast::Receiver<BlockEvent>> {
        self.websocket.as_ref().map(WsResilienceManager::subscribe_blocks)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.pool.notifications().subscribe()
    }

    pub async fn force_heal(&self) -> HealReport {
        self.monitor.force_heal().await
    }

    #[must_use]
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            chain: self.name.clone(),
            pool: self.pool.stats(),
            gas: self.gas_cache.stats(),
            websocket: self.websocket.as_ref().map(WsResilienceManager::status).unwrap_or_default(),
        }
    }

    /// Connects the WebSocket feed. Returns the number of live connections.
    pub async fn connect(&self) -> usize {
        match &self.websocket {
            Some(manager) => manager.start().await,
            None => 0,
        }
    }

    /// Tears down WebSocket connections. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = &self.websocket {
            manager.cleanup().await;
        }
        info!(chain = %self.name, "chain access disconnected");
    }

    /// Alias of [`Self::disconnect`].
    pub async fn cleanup(&self) {
        self.disconnect().await;
    }
}

fn quantity(value: &Value) -> Result<u128, UpstreamError> {
    value
        .as_str()
        .and_then(parse_hex_quantity)
        .ok_or_else(|| UpstreamError::InvalidResponse(format!("expected hex quantity, got {value}")))
}
