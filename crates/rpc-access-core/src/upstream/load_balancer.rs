use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use arc_swap::ArcSwap;

use crate::upstream::endpoint::UpstreamEndpoint;

/// Round-robin selector over a dynamic candidate set.
///
/// Uses `ArcSwap` for lock-free reads of the endpoint list. The candidate set is
/// recomputed by the caller on every selection; the counter only ever increases, so K
/// consecutive selections over a stable set of K candidates visit each one exactly once.
pub struct LoadBalancer {
    upstreams: ArcSwap<Vec<Arc<UpstreamEndpoint>>>,
    current_index: AtomicUsize,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self { upstreams: ArcSwap::from_pointee(Vec::new()), current_index: AtomicUsize::new(0) }
    }

    /// Adds an endpoint using atomic read-copy-update, without blocking readers.
    pub fn add_upstream(&self, upstream: Arc<UpstreamEndpoint>) {
        self.upstreams.rcu(|current| {
            let mut new_upstreams = (**current).clone();
            new_upstreams.push(upstream.clone());
            new_upstreams
        });
    }

    /// Removes an endpoint by name. Returns `true` if one was removed.
    pub fn remove_upstream(&self, name: &str) -> bool {
        let before = self.upstreams.load().len();
        self.upstreams.rcu(|current| {
            current.iter().filter(|u| u.name().as_ref() != name).cloned().collect::<Vec<_>>()
        });
        self.upstreams.load().len() < before
    }

    #[must_use]
    pub fn get_upstream_by_name(&self, name: &str) -> Option<Arc<UpstreamEndpoint>> {
        self.upstreams.load().iter().find(|u| u.name().as_ref() == name).cloned()
    }

    #[must_use]
    pub fn get_all_upstreams(&self) -> Arc<Vec<Arc<UpstreamEndpoint>>> {
        self.upstreams.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.upstreams.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the next candidate in round-robin order.
    #[must_use]
    pub fn select(&self, candidates: &[Arc<UpstreamEndpoint>]) -> Option<Arc<UpstreamEndpoint>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.current_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
        tracing::trace!(
            current_index = index,
            total_candidates = candidates.len(),
            upstream = %candidates[index].name(),
            "selecting upstream"
        );
        Some(candidates[index].clone())
    }
}
