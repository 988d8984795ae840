//! HTTP provider pool and its supporting pieces.
//!
//! A [`ProviderPool`] owns the endpoints of one chain and decides, per request, which one
//! may be used:
//! - the [`RateBudget`] admits a request only if both the endpoint window and the chain-wide
//!   window have room, counting in-flight reservations as used
//! - the [`CooldownTracker`] parks endpoints that returned rate-limit (30s for free
//!   providers, 5min for quota-limited ones) or quota-exhausted (24h) failures
//! - the [`LoadBalancer`] rotates over what is left, preferring free providers
//!
//! When nothing is eligible the pool enters emergency recovery: cooldowns and windows are
//! cleared first, then health flags are reset. Quota-exhausted endpoints stay out in both
//! stages. The [`SelfHealingMonitor`] probes unhealthy endpoints in the background and
//! returns the ones that answer.
//!
//! ```text
//! Transport error ──► UpstreamError::kind()
//!                          │
//!        ┌─────────────────┼──────────────────┬──────────────┐
//!        ▼                 ▼                  ▼              ▼
//!   RateLimited     QuotaExhausted        Transient        Other
//!   cooldown        24h quarantine        failure count    no penalty
//!   (by class)                            → unhealthy
//! ```

pub mod builder;
pub mod circuit_breaker;
pub mod cooldown;
pub mod endpoint;
pub mod errors;
pub mod health;
pub mod http_client;
pub mod load_balancer;
pub mod pool;
pub mod rate_budget;
pub mod transport;

pub use builder::{BuilderError, ProviderPoolBuilder};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use cooldown::CooldownTracker;
pub use endpoint::{EndpointHealth, HealthHistoryEntry, ProbeOutcome, UpstreamEndpoint};
pub use errors::{FailureKind, UpstreamError, WsError};
pub use health::{HealReport, SelfHealingMonitor};
pub use http_client::{HttpClient, HttpClientConfig};
pub use load_balancer::LoadBalancer;
pub use pool::{EndpointStatus, PoolStats, ProviderPool, ProviderPoolConfig};
pub use rate_budget::{RateBudget, RateWindow, Reservation};
pub use transport::RpcTransport;
