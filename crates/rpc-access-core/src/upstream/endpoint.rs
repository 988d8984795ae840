use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

use crate::{
    types::{parse_hex_quantity, EndpointConfig},
    upstream::transport::RpcTransport,
};

use super::errors::UpstreamError;

/// Health state of one endpoint.
///
/// `unhealthy_since` is set iff `healthy == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<Instant>,
    pub unhealthy_since: Option<Instant>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self { healthy: true, consecutive_failures: 0, last_checked_at: None, unhealthy_since: None }
    }
}

/// Entry in the health history log.
#[derive(Debug, Clone)]
pub struct HealthHistoryEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub healthy: bool,
    pub reason: String,
}

/// Result of an active liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub block_number: Option<u64>,
    /// Time spent out of rotation, set only when this probe restored the endpoint.
    pub recovered_after: Option<Duration>,
}

const HEALTH_HISTORY_SIZE: usize = 32;

/// Releases the probe slot on drop and publishes `result`. A probe dropped mid-flight
/// publishes `None`, so waiting callers retry instead of waiting out their timeout.
struct ProbeGuard<'a> {
    endpoint: &'a UpstreamEndpoint,
    result: Option<(bool, Option<u64>)>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        // Cleared before publishing: a caller that subscribes after the send sees the
        // free slot and leads a new probe.
        self.endpoint.probe_in_flight.store(false, Ordering::SeqCst);
        self.endpoint.probe_result.send_replace(self.result.take());
    }
}

/// One registered RPC endpoint with its health state.
///
/// Health moves to unhealthy after `failure_threshold` consecutive transient failures and
/// back to healthy only through [`probe`](Self::probe) or an explicit
/// [`mark_recovered`](Self::mark_recovered). Passive request success only resets the
/// failure counter.
///
/// Probes use a singleflight: concurrent callers share the in-flight probe's result.
pub struct UpstreamEndpoint {
    config: EndpointConfig,
    transport: Arc<dyn RpcTransport>,
    health: RwLock<EndpointHealth>,
    health_history: RwLock<VecDeque<HealthHistoryEntry>>,
    failure_threshold: u32,
    probe_in_flight: AtomicBool,
    probe_result: watch::Sender<Option<(bool, Option<u64>)>>,
}

impl std::fmt::Debug for UpstreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamEndpoint")
            .field("name", &self.config.name)
            .field("class", &self.config.class)
            .field("health", &*self.health.read())
            .finish_non_exhaustive()
    }
}

impl UpstreamEndpoint {
    #[must_use]
    pub fn new(
        config: EndpointConfig,
        transport: Arc<dyn RpcTransport>,
        failure_threshold: u32,
    ) -> Self {
        let (probe_result, _) = watch::channel(None);
        Self {
            config,
            transport,
            health: RwLock::new(EndpointHealth::default()),
            health_history: RwLock::new(VecDeque::with_capacity(HEALTH_HISTORY_SIZE)),
            failure_threshold: failure_threshold.max(1),
            probe_in_flight: AtomicBool::new(false),
            probe_result,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.config.name
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.read().healthy
    }

    #[must_use]
    pub fn health(&self) -> EndpointHealth {
        *self.health.read()
    }

    /// Issues a JSON-RPC call through this endpoint's transport.
    ///
    /// Health is not touched here; the pool accounts for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the transport's classified [`UpstreamError`].
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        self.transport.call(&self.config, method, params).await
    }

    /// Passive success: resets the failure counter without restoring health.
    pub fn record_success(&self) {
        let mut health = self.health.write();
        health.consecutive_failures = 0;
        health.last_checked_at = Some(Instant::now());
    }

    /// Passive failure. Returns the failure count if this call made the endpoint unhealthy.
    pub fn record_failure(&self, reason: &str) -> Option<u32> {
        let failures = {
            let mut health = self.health.write();
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_checked_at = Some(Instant::now());
            if !health.healthy || health.consecutive_failures < self.failure_threshold {
                return None;
            }
            health.healthy = false;
            health.unhealthy_since = Some(Instant::now());
            health.consecutive_failures
        };

        tracing::warn!(
            upstream = %self.config.name,
            error_count = failures,
            reason,
            "upstream is unhealthy after consecutive errors"
        );
        self.record_health_history(false, reason.to_string());
        Some(failures)
    }

    /// Takes the endpoint out of rotation regardless of its failure count.
    ///
    /// Returns `true` if the endpoint was healthy before.
    pub fn mark_unhealthy(&self, reason: &str) -> bool {
        {
            let mut health = self.health.write();
            health.last_checked_at = Some(Instant::now());
            if !health.healthy {
                return false;
            }
            health.healthy = false;
            health.unhealthy_since = Some(Instant::now());
        }
        self.record_health_history(false, reason.to_string());
        true
    }

    /// Restores the endpoint. Returns the downtime if it was unhealthy.
    pub fn mark_recovered(&self, reason: &str) -> Option<Duration> {
        let downtime = {
            let mut health = self.health.write();
            let now = Instant::now();
            health.last_checked_at = Some(now);
            health.consecutive_failures = 0;
            if health.healthy {
                return None;
            }
            health.healthy = true;
            health.unhealthy_since.take().map(|since| now.saturating_duration_since(since))
        };
        self.record_health_history(true, reason.to_string());
        Some(downtime.unwrap_or_default())
    }

    /// Returns how long the endpoint has been out of rotation.
    #[must_use]
    pub fn unhealthy_for(&self) -> Option<Duration> {
        self.health.read().unhealthy_since.map(|since| Instant::now().saturating_duration_since(since))
    }

    /// Sends an `eth_blockNumber` liveness probe bounded by `timeout`.
    ///
    /// A successful probe restores an unhealthy endpoint. A failed probe only updates
    /// `last_checked_at`. Concurrent callers share the result of the probe in flight; if
    /// that probe is dropped before finishing, a waiting caller runs its own.
    pub async fn probe(&self, timeout: Duration) -> ProbeOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let mut guard = ProbeGuard { endpoint: self, result: None };
                let outcome = self.do_probe(deadline.saturating_duration_since(Instant::now())).await;
                guard.result = Some((outcome.healthy, outcome.block_number));
                drop(guard);
                return outcome;
            }

            let mut receiver = self.probe_result.subscribe();
            // The leader may have finished between the exchange and the subscribe.
            if !self.probe_in_flight.load(Ordering::SeqCst) {
                continue;
            }
            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => {
                    if let Some((healthy, block_number)) = *receiver.borrow_and_update() {
                        tracing::trace!(
                            upstream = %self.config.name,
                            "singleflight: reusing in-flight probe result"
                        );
                        return ProbeOutcome { healthy, block_number, recovered_after: None };
                    }
                    tracing::debug!(upstream = %self.config.name, "in-flight probe dropped, retrying");
                }
                Ok(Err(_)) | Err(_) => {
                    return ProbeOutcome {
                        healthy: self.is_healthy(),
                        block_number: None,
                        recovered_after: None,
                    };
                }
            }
        }
    }

    async fn do_probe(&self, timeout: Duration) -> ProbeOutcome {
        let result = tokio::time::timeout(
            timeout,
            self.transport.call(&self.config, "eth_blockNumber", Value::Array(vec![])),
        )
        .await
        .unwrap_or(Err(UpstreamError::Timeout));

        match result {
            Ok(value) => {
                let block_number = value
                    .as_str()
                    .and_then(parse_hex_quantity)
                    .and_then(|n| u64::try_from(n).ok());
                let recovered_after = self.mark_recovered("probe succeeded");
                ProbeOutcome { healthy: true, block_number, recovered_after }
            }
            Err(e) => {
                tracing::debug!(upstream = %self.config.name, error = %e, "probe failed");
                self.health.write().last_checked_at = Some(Instant::now());
                ProbeOutcome { healthy: false, block_number: None, recovered_after: None }
            }
        }
    }

    fn record_health_history(&self, healthy: bool, reason: String) {
        let mut history = self.health_history.write();
        history.push_back(HealthHistoryEntry { timestamp: chrono::Utc::now(), healthy, reason });
        if history.len() > HEALTH_HISTORY_SIZE {
            history.pop_front();
        }
    }

    /// Returns recent health transitions, newest first.
    #[must_use]
    pub fn health_history(&self, limit: usize) -> Vec<HealthHistoryEntry> {
        self.health_history.read().iter().rev().take(limit).cloned().collect()
    }
}
