use crate::{config::HealthConfig, events::Notification};

use super::{endpoint::UpstreamEndpoint, pool::ProviderPool};
use futures::future::join_all;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

/// Outcome of one healing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub probed: usize,
    pub recovered: Vec<Arc<str>>,
    pub still_unhealthy: Vec<Arc<str>>,
    pub cooldowns_swept: usize,
}

/// Periodically probes unhealthy endpoints and restores the ones that answer.
///
/// An endpoint is only probed once it has been out of rotation for
/// `min_recovery_seconds`, so a flapping provider is not hammered. Each pass also
/// sweeps expired cooldown and quarantine entries.
pub struct SelfHealingMonitor {
    pool: Arc<ProviderPool>,
    config: HealthConfig,
}

impl SelfHealingMonitor {
    #[must_use]
    pub fn new(pool: Arc<ProviderPool>, config: HealthConfig) -> Self {
        Self { pool, config }
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_seconds.max(1))
    }

    fn min_recovery(&self) -> Duration {
        Duration::from_secs(self.config.min_recovery_seconds)
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.probe_timeout_ms.max(1))
    }

    /// Spawns the periodic healing loop. The first pass runs one interval after start.
    #[must_use]
    pub fn start_with_shutdown(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let check_interval = self.check_interval();

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + check_interval, check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = monitor.heal_once().await;
                        if report.probed > 0 {
                            info!(
                                chain = %monitor.pool.chain(),
                                probed = report.probed,
                                recovered = report.recovered.len(),
                                still_unhealthy = report.still_unhealthy.len(),
                                "healing pass complete"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(chain = %monitor.pool.chain(), "self-healing monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Probes every endpoint unhealthy for at least `min_recovery_seconds`.
    pub async fn heal_once(&self) -> HealReport {
        let candidates = self.pool.unhealthy_endpoints(self.min_recovery());
        self.heal(candidates).await
    }

    /// Probes every unhealthy endpoint now, regardless of how long it has been down.
    pub async fn force_heal(&self) -> HealReport {
        info!(chain = %self.pool.chain(), "forced healing pass");
        let candidates = self.pool.unhealthy_endpoints(Duration::ZERO);
        self.heal(candidates).await
    }

    async fn heal(&self, candidates: Vec<Arc<UpstreamEndpoint>>) -> HealReport {
        let timeout = self.probe_timeout();
        let outcomes =
            join_all(candidates.iter().map(|endpoint| async move { endpoint.probe(timeout).await }))
                .await;

        let mut report = HealReport { probed: candidates.len(), ..HealReport::default() };
        for (endpoint, outcome) in candidates.iter().zip(outcomes) {
            if outcome.healthy {
                if let Some(downtime) = outcome.recovered_after {
                    info!(
                        upstream = %endpoint.name(),
                        downtime_secs = downtime.as_secs(),
                        block = ?outcome.block_number,
                        "upstream recovered"
                    );
                    self.pool.notifications().emit(Notification::EndpointRecovered {
                        endpoint: endpoint.name().clone(),
                        downtime,
                    });
                }
                report.recovered.push(endpoint.name().clone());
            } else {
                debug!(upstream = %endpoint.name(), "upstream still unhealthy");
                report.still_unhealthy.push(endpoint.name().clone());
            }
        }

        report.cooldowns_swept = self.pool.sweep_cooldowns();
        report
    }
}
