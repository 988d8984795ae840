//! Endpoint cooldowns.
//!
//! Short penalties (rate limits) and quota quarantines live in two separate maps.
//! Emergency recovery clears only the short map; the sweep drops expired entries from
//! both, so a quarantined endpoint stays out until its own deadline passes.

use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct CooldownTracker {
    cooldowns: DashMap<Arc<str>, Instant>,
    quota_exhausted: DashMap<Arc<str>, Instant>,
}

impl CooldownTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `endpoint` on a short cooldown. An existing later deadline is kept.
    pub fn set_cooldown(&self, endpoint: &Arc<str>, duration: Duration) -> Instant {
        let until = Instant::now() + duration;
        let mut entry = self.cooldowns.entry(endpoint.clone()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        *entry
    }

    /// Quarantines `endpoint` for a long-horizon quota exhaustion.
    pub fn set_quota_exhausted(&self, endpoint: &Arc<str>, duration: Duration) -> Instant {
        let until = Instant::now() + duration;
        self.quota_exhausted.insert(endpoint.clone(), until);
        until
    }

    /// Returns `true` while `now < until` for a short cooldown.
    #[must_use]
    pub fn is_cooling_down(&self, endpoint: &str) -> bool {
        self.cooldowns.get(endpoint).is_some_and(|until| Instant::now() < *until)
    }

    #[must_use]
    pub fn is_quota_exhausted(&self, endpoint: &str) -> bool {
        self.quota_exhausted.get(endpoint).is_some_and(|until| Instant::now() < *until)
    }

    /// Returns `true` if neither a cooldown nor a quarantine applies.
    #[must_use]
    pub fn is_available(&self, endpoint: &str) -> bool {
        !self.is_cooling_down(endpoint) && !self.is_quota_exhausted(endpoint)
    }

    #[must_use]
    pub fn cooldown_remaining(&self, endpoint: &str) -> Option<Duration> {
        let now = Instant::now();
        self.cooldowns
            .get(endpoint)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    #[must_use]
    pub fn quota_remaining(&self, endpoint: &str) -> Option<Duration> {
        let now = Instant::now();
        self.quota_exhausted
            .get(endpoint)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Clears every short cooldown. Quota quarantines are untouched.
    pub fn clear_cooldowns(&self) -> usize {
        let cleared = self.cooldowns.len();
        self.cooldowns.clear();
        cleared
    }

    /// Lifts a quota quarantine ahead of its deadline.
    pub fn clear_quota_exhausted(&self, endpoint: &str) -> bool {
        self.quota_exhausted.remove(endpoint).is_some()
    }

    /// Drops expired entries from both maps, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        // Counted inside `retain`: concurrent inserts would skew a before/after length diff.
        let mut removed = 0;
        let mut keep = |_: &Arc<str>, until: &mut Instant| {
            let live = now < *until;
            if !live {
                removed += 1;
            }
            live
        };
        self.cooldowns.retain(&mut keep);
        self.quota_exhausted.retain(&mut keep);
        if removed > 0 {
            debug!(removed, "swept expired cooldowns");
        }
        removed
    }

    pub fn forget(&self, endpoint: &str) {
        self.cooldowns.remove(endpoint);
        self.quota_exhausted.remove(endpoint);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cooldowns.len() + self.quota_exhausted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
