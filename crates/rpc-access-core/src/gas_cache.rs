//! Short-lived fee cache with request coalescing.
//!
//! Concurrent misses share a single upstream fetch. When a refresh fails, a value younger
//! than the stale TTL is served instead of the error.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use crate::{config::GasCacheConfig, types::FeeData, upstream::errors::UpstreamError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GasCacheError {
    #[error("Gas price fetch failed: {0}")]
    Fetch(#[from] UpstreamError),

    /// Failure of a fetch this caller joined rather than led.
    #[error("Gas price fetch failed: {0}")]
    Shared(String),
}

type FetchOutcome = Option<Result<FeeData, String>>;

#[derive(Debug, Clone, Copy)]
struct CachedFee {
    fee: FeeData,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GasCacheStats {
    pub hits: u64,
    pub fetches: u64,
    pub coalesced: u64,
    pub stale_served: u64,
}

/// Clears the in-flight slot when the leading fetch finishes or is dropped.
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<FetchOutcome>>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

pub struct GasPriceCache {
    ttl: Duration,
    stale_ttl: Duration,
    entry: RwLock<Option<CachedFee>>,
    in_flight: Mutex<Option<watch::Receiver<FetchOutcome>>>,
    hits: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    stale_served: AtomicU64,
}

impl GasPriceCache {
    #[must_use]
    pub fn new(config: &GasCacheConfig) -> Self {
        let ttl = Duration::from_millis(config.ttl_ms);
        Self {
            ttl,
            stale_ttl: Duration::from_millis(config.stale_ttl_ms).max(ttl),
            entry: RwLock::new(None),
            in_flight: Mutex::new(None),
            hits: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
        }
    }

    fn cached_within(&self, max_age: Duration) -> Option<FeeData> {
        let entry = *self.entry.read();
        entry.filter(|cached| cached.fetched_at.elapsed() < max_age).map(|cached| cached.fee)
    }

    /// Returns the cached fee if it is still fresh.
    #[must_use]
    pub fn peek(&self) -> Option<FeeData> {
        self.cached_within(self.ttl)
    }

    /// Returns a fresh cached fee, or runs `fetch` once for all concurrent callers.
    ///
    /// If the leading caller is dropped before its fetch completes, a waiting caller
    /// takes over and runs its own `fetch`.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when no value younger than the stale TTL is cached.
    /// Callers that joined an in-flight fetch get [`GasCacheError::Shared`].
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<FeeData, GasCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FeeData, UpstreamError>>,
    {
        let mut joined = false;
        let sender = loop {
            if let Some(fee) = self.peek() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(fee);
            }

            let mut receiver = {
                let mut slot = self.in_flight.lock();
                match slot.as_ref() {
                    Some(receiver) => receiver.clone(),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        *slot = Some(receiver);
                        break sender;
                    }
                }
            };

            if !joined {
                joined = true;
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("joining in-flight gas price fetch");
            }
            let outcome = match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => {
                    debug!("leading gas price fetch was dropped, taking over");
                    continue;
                }
            };
            match outcome {
                Some(Ok(fee)) => return Ok(fee),
                Some(Err(message)) => return Err(GasCacheError::Shared(message)),
                None => continue,
            }
        };

        let _guard = InFlightGuard { slot: &self.in_flight };
        self.fetches.fetch_add(1, Ordering::Relaxed);

        match fetch().await {
            Ok(fee) => {
                self.inject(fee);
                sender.send_replace(Some(Ok(fee)));
                Ok(fee)
            }
            Err(e) => match self.cached_within(self.stale_ttl) {
                Some(stale) => {
                    warn!(error = %e, "gas price refresh failed, serving stale value");
                    self.stale_served.fetch_add(1, Ordering::Relaxed);
                    sender.send_replace(Some(Ok(stale)));
                    Ok(stale)
                }
                None => {
                    sender.send_replace(Some(Err(e.to_string())));
                    Err(GasCacheError::Fetch(e))
                }
            },
        }
    }

    /// Stores a fee observed elsewhere, e.g. from a block header.
    pub fn inject(&self, fee: FeeData) {
        *self.entry.write() = Some(CachedFee { fee, fetched_at: Instant::now() });
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }

    #[must_use]
    pub fn stats(&self) -> GasCacheStats {
        GasCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
        }
    }
}
