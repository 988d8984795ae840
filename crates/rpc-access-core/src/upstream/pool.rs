use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    config::{RateLimitConfig, RetryConfig},
    events::{Notification, NotificationBus},
    types::EndpointConfig,
    upstream::{
        cooldown::CooldownTracker,
        endpoint::UpstreamEndpoint,
        errors::{FailureKind, UpstreamError},
        load_balancer::LoadBalancer,
        rate_budget::{RateBudget, Reservation},
        transport::RpcTransport,
    },
};

/// Settings of a [`ProviderPool`].
#[derive(Debug, Clone, Default)]
pub struct ProviderPoolConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

impl ProviderPoolConfig {
    fn min_request_spacing(&self) -> Duration {
        Duration::from_millis(self.rate_limit.min_request_spacing_ms)
    }

    fn admission_retry(&self) -> Duration {
        Duration::from_millis(self.rate_limit.admission_retry_ms)
    }

    fn rate_limit_cooldown(&self, endpoint: &EndpointConfig) -> Duration {
        if endpoint.class.is_quota_limited() {
            Duration::from_secs(self.retry.quota_limited_cooldown_secs)
        } else {
            Duration::from_secs(self.retry.free_cooldown_secs)
        }
    }

    fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry.quota_exhausted_cooldown_secs)
    }

    /// Backoff before the attempt following failed attempt `attempt` (zero-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry.base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rollovers: AtomicU64,
    emergency_resets: AtomicU64,
}

/// Point-in-time status of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: Arc<str>,
    pub quota_limited: bool,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub quota_exhausted: bool,
    pub window_completed: u32,
    pub window_pending: u32,
}

/// Point-in-time snapshot of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub chain: Arc<str>,
    pub endpoints: Vec<EndpointStatus>,
    pub global_completed: u32,
    pub global_pending: u32,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rollovers: u64,
    pub emergency_resets: u64,
}

/// Load-balanced pool of HTTP JSON-RPC endpoints for one chain.
///
/// Selection is round-robin over endpoints that are healthy, not cooling down, not
/// quota-exhausted and under their rate window, preferring free providers. Failures are
/// classified by [`FailureKind`] and turned into penalties; rate limits and quota
/// exhaustion roll over to another endpoint without spending the caller's retry budget.
pub struct ProviderPool {
    chain: Arc<str>,
    load_balancer: LoadBalancer,
    budget: RateBudget,
    cooldowns: CooldownTracker,
    config: ProviderPoolConfig,
    notifications: NotificationBus,
    next_slot: Mutex<Instant>,
    counters: PoolCounters,
}

impl ProviderPool {
    #[must_use]
    pub fn new(chain: &str, config: ProviderPoolConfig, notifications: NotificationBus) -> Self {
        let budget = RateBudget::new(
            config.rate_limit.requests_per_minute,
            config.rate_limit.global_requests_per_minute,
            Duration::from_secs(config.rate_limit.window_seconds.max(1)),
        );
        Self {
            chain: Arc::from(chain),
            load_balancer: LoadBalancer::new(),
            budget,
            cooldowns: CooldownTracker::new(),
            config,
            notifications,
            next_slot: Mutex::new(Instant::now()),
            counters: PoolCounters::default(),
        }
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<str> {
        &self.chain
    }

    #[must_use]
    pub fn config(&self) -> &ProviderPoolConfig {
        &self.config
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    /// Registers an endpoint served by `transport`.
    pub fn add_endpoint(&self, config: EndpointConfig, transport: Arc<dyn RpcTransport>) {
        info!(chain = %self.chain, name = %config.name, class = ?config.class, "adding upstream endpoint");
        self.budget.register(&config.name, config.requests_per_minute);
        let endpoint =
            Arc::new(UpstreamEndpoint::new(config, transport, self.config.retry.failure_threshold));
        self.load_balancer.add_upstream(endpoint);
    }

    pub fn remove_endpoint(&self, name: &str) -> bool {
        let removed = self.load_balancer.remove_upstream(name);
        if removed {
            self.budget.unregister(name);
            self.cooldowns.forget(name);
            info!(chain = %self.chain, name, "removed upstream endpoint");
        }
        removed
    }

    #[must_use]
    pub fn endpoints(&self) -> Arc<Vec<Arc<UpstreamEndpoint>>> {
        self.load_balancer.get_all_upstreams()
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Arc<UpstreamEndpoint>> {
        self.load_balancer.get_upstream_by_name(name)
    }

    #[must_use]
    pub fn rate_budget(&self) -> &RateBudget {
        &self.budget
    }

    #[must_use]
    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Returns `true` if `endpoint` may be selected right now.
    #[must_use]
    pub fn is_eligible(&self, endpoint: &UpstreamEndpoint) -> bool {
        endpoint.is_healthy() &&
            self.cooldowns.is_available(endpoint.name()) &&
            self.budget.has_capacity(endpoint.name())
    }

    fn select_eligible(
        &self,
        upstreams: &[Arc<UpstreamEndpoint>],
    ) -> Option<Arc<UpstreamEndpoint>> {
        let candidates: Vec<_> = upstreams.iter().filter(|u| self.is_eligible(u)).cloned().collect();
        let preferred: Vec<_> = candidates
            .iter()
            .filter(|u| !u.config().class.is_quota_limited())
            .cloned()
            .collect();

        if preferred.is_empty() {
            self.load_balancer.select(&candidates)
        } else {
            self.load_balancer.select(&preferred)
        }
    }

    /// Selects an endpoint, falling back to emergency recovery when none is eligible.
    ///
    /// Never suspends. Succeeds as long as one endpoint is not quota-exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NoHealthyUpstreams`] if the pool is empty or every endpoint
    /// is quota-exhausted.
    pub fn get_provider(&self) -> Result<Arc<UpstreamEndpoint>, UpstreamError> {
        let upstreams = self.load_balancer.get_all_upstreams();
        if upstreams.is_empty() {
            return Err(UpstreamError::NoHealthyUpstreams);
        }

        if let Some(endpoint) = self.select_eligible(&upstreams) {
            return Ok(endpoint);
        }

        self.emergency_select(&upstreams).ok_or(UpstreamError::NoHealthyUpstreams)
    }

    /// Degraded mode: trades rate ceilings for liveness. Quota quarantines always hold.
    fn emergency_select(&self, upstreams: &[Arc<UpstreamEndpoint>]) -> Option<Arc<UpstreamEndpoint>> {
        let recoverable: Vec<_> = upstreams
            .iter()
            .filter(|u| !self.cooldowns.is_quota_exhausted(u.name()))
            .cloned()
            .collect();

        if recoverable.is_empty() {
            error!(chain = %self.chain, total = upstreams.len(), "every upstream is quota-exhausted");
            return None;
        }

        self.counters.emergency_resets.fetch_add(1, Ordering::Relaxed);
        let cleared = self.cooldowns.clear_cooldowns();
        self.budget.reset_all();
        warn!(
            chain = %self.chain,
            cleared_cooldowns = cleared,
            "no eligible upstream, emergency recovery cleared cooldowns and rate windows"
        );

        if let Some(endpoint) = self.select_eligible(&recoverable) {
            return Some(endpoint);
        }

        for endpoint in &recoverable {
            endpoint.mark_recovered("emergency reset");
        }
        warn!(
            chain = %self.chain,
            reset = recoverable.len(),
            "all upstreams unhealthy, emergency recovery reset health flags"
        );

        self.select_eligible(&recoverable)
    }

    /// Admits one request against `endpoint` and the pool-wide window.
    #[must_use]
    pub fn can_reserve(&self, endpoint: &UpstreamEndpoint) -> Option<Reservation> {
        self.budget.try_reserve(endpoint.name())
    }

    fn any_capacity(&self) -> bool {
        self.load_balancer.get_all_upstreams().iter().any(|u| self.is_eligible(u))
    }

    fn has_alternative(&self, excluded: &str) -> bool {
        self.load_balancer
            .get_all_upstreams()
            .iter()
            .any(|u| u.name().as_ref() != excluded && self.is_eligible(u))
    }

    /// Sleeps until this caller's slot so consecutive requests are spaced out.
    async fn throttle(&self) {
        let spacing = self.config.min_request_spacing();
        if spacing.is_zero() {
            return;
        }
        let wait = {
            let mut next_slot = self.next_slot.lock();
            let now = Instant::now();
            let slot = (*next_slot).max(now);
            *next_slot = slot + spacing;
            slot - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Passive success report for callers driving their own retry loop.
    pub fn report_success(&self, endpoint: &UpstreamEndpoint) {
        endpoint.record_success();
    }

    /// Applies the penalty matching the error's classification.
    pub fn report_failure(&self, endpoint: &UpstreamEndpoint, error: &UpstreamError) {
        match error.kind() {
            FailureKind::QuotaExhausted => {
                let cooldown = self.config.quota_cooldown();
                self.cooldowns.set_quota_exhausted(endpoint.name(), cooldown);
                warn!(
                    chain = %self.chain,
                    upstream = %endpoint.name(),
                    cooldown_secs = cooldown.as_secs(),
                    error = %error,
                    "upstream quota exhausted, quarantined"
                );
                if endpoint.mark_unhealthy("quota exhausted") {
                    self.notifications.emit(Notification::EndpointUnhealthy {
                        endpoint: endpoint.name().clone(),
                        consecutive_failures: endpoint.health().consecutive_failures,
                        reason: error.to_string(),
                    });
                }
            }
            FailureKind::RateLimited => {
                let cooldown = self.config.rate_limit_cooldown(endpoint.config());
                self.cooldowns.set_cooldown(endpoint.name(), cooldown);
                warn!(
                    chain = %self.chain,
                    upstream = %endpoint.name(),
                    cooldown_secs = cooldown.as_secs(),
                    "upstream rate limited, cooling down"
                );
            }
            FailureKind::Transient => {
                if let Some(failures) = endpoint.record_failure(&error.to_string()) {
                    self.notifications.emit(Notification::EndpointUnhealthy {
                        endpoint: endpoint.name().clone(),
                        consecutive_failures: failures,
                        reason: error.to_string(),
                    });
                }
            }
            FailureKind::Other => {
                debug!(upstream = %endpoint.name(), error = %error, "request failed without upstream penalty");
            }
        }
    }

    /// Runs `operation` against selected endpoints until it succeeds or the attempt
    /// budget is spent.
    ///
    /// `operation` may be invoked several times and must be safe to repeat. Rate-limited
    /// and quota-exhausted failures roll over to another endpoint without consuming an
    /// attempt while an alternative is eligible; other failures back off
    /// `base_delay * 2^attempt` and consume one.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RetriesExhausted`] wrapping the last underlying error.
    pub async fn with_retry<T, F, Fut>(
        &self,
        max_attempts: Option<u32>,
        mut operation: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut(Arc<UpstreamEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = max_attempts.unwrap_or(self.config.retry.max_attempts).max(1);
        let rollover_limit = self.load_balancer.len().saturating_mul(4).max(4);
        let mut attempt = 0u32;
        let mut rollovers = 0usize;
        let mut last_error: Option<UpstreamError> = None;

        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        while attempt < max_attempts {
            self.throttle().await;

            let endpoint = match self.get_provider() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    last_error = Some(e);
                    attempt += 1;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_delay(attempt - 1)).await;
                    }
                    continue;
                }
            };

            let Some(reservation) = self.can_reserve(&endpoint) else {
                if rollovers < rollover_limit && self.any_capacity() {
                    rollovers += 1;
                    debug!(upstream = %endpoint.name(), "admission denied, reselecting");
                    tokio::time::sleep(self.config.admission_retry()).await;
                    continue;
                }
                last_error = Some(UpstreamError::RateBudgetExhausted);
                attempt += 1;
                if attempt < max_attempts {
                    tokio::time::sleep(self.config.backoff_delay(attempt - 1)).await;
                }
                continue;
            };

            debug!(chain = %self.chain, upstream = %endpoint.name(), attempt, "dispatching request");

            match operation(endpoint.clone()).await {
                Ok(value) => {
                    reservation.commit();
                    self.report_success(&endpoint);
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(error) => {
                    reservation.release();
                    self.report_failure(&endpoint, &error);
                    let kind = error.kind();
                    last_error = Some(error);

                    if kind.is_routing_signal() &&
                        rollovers < rollover_limit &&
                        self.has_alternative(endpoint.name())
                    {
                        rollovers += 1;
                        self.counters.rollovers.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            upstream = %endpoint.name(),
                            failure = %kind,
                            "rolling over to another upstream"
                        );
                        continue;
                    }

                    attempt += 1;
                    if attempt < max_attempts {
                        let delay = self.config.backoff_delay(attempt - 1);
                        debug!(
                            upstream = %endpoint.name(),
                            failure = %kind,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "request failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let source = last_error.unwrap_or(UpstreamError::NoHealthyUpstreams);
        warn!(chain = %self.chain, attempts = attempt, error = %source, "all attempts failed");
        Err(UpstreamError::RetriesExhausted { attempts: attempt, source: Box::new(source) })
    }

    /// Endpoints that have been out of rotation for at least `min_age`.
    #[must_use]
    pub fn unhealthy_endpoints(&self, min_age: Duration) -> Vec<Arc<UpstreamEndpoint>> {
        self.load_balancer
            .get_all_upstreams()
            .iter()
            .filter(|u| u.unhealthy_for().is_some_and(|age| age >= min_age))
            .cloned()
            .collect()
    }

    /// Drops expired cooldown and quarantine entries.
    pub fn sweep_cooldowns(&self) -> usize {
        self.cooldowns.sweep_expired()
    }

    /// Lifts a quota quarantine ahead of its 24h deadline.
    pub fn clear_quota_exhaustion(&self, name: &str) -> bool {
        let cleared = self.cooldowns.clear_quota_exhausted(name);
        if cleared {
            warn!(chain = %self.chain, upstream = name, "quota quarantine lifted by operator");
        }
        cleared
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let endpoints = self
            .load_balancer
            .get_all_upstreams()
            .iter()
            .map(|u| {
                let health = u.health();
                let window = self.budget.endpoint_window(u.name());
                EndpointStatus {
                    name: u.name().clone(),
                    quota_limited: u.config().class.is_quota_limited(),
                    healthy: health.healthy,
                    consecutive_failures: health.consecutive_failures,
                    cooldown_remaining_ms: self
                        .cooldowns
                        .cooldown_remaining(u.name())
                        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                    quota_exhausted: self.cooldowns.is_quota_exhausted(u.name()),
                    window_completed: window.map_or(0, |w| w.completed),
                    window_pending: window.map_or(0, |w| w.pending),
                }
            })
            .collect();
        let global = self.budget.global_window();

        PoolStats {
            chain: self.chain.clone(),
            endpoints,
            global_completed: global.completed,
            global_pending: global.pending,
            requests: self.counters.requests.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rollovers: self.counters.rollovers.load(Ordering::Relaxed),
            emergency_resets: self.counters.emergency_resets.load(Ordering::Relaxed),
        }
    }
}
