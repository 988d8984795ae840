//! Fixed-window request budgets with reservations.
//!
//! Each endpoint has its own window and every endpoint of a pool also shares one global
//! window. Admission checks both windows and bumps both pending counters while holding a
//! single mutex, so two concurrent callers can never both take the last slot.
//!
//! ```text
//! try_reserve ──► pending += 1 ──┬── commit  ──► pending -= 1, completed += 1
//!                                ├── release ──► pending -= 1
//!                                └── drop    ──► pending -= 1   (cancellation)
//! ```

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::trace;

/// Counters of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub completed: u32,
    pub pending: u32,
    pub max: u32,
    pub reset_at: Instant,
    /// Incremented on every reset so late reservations do not touch a newer window.
    generation: u64,
}

impl RateWindow {
    fn new(max: u32, now: Instant, length: Duration) -> Self {
        Self { completed: 0, pending: 0, max, reset_at: now + length, generation: 0 }
    }

    /// Effective utilization, in-flight reservations included.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.completed.saturating_add(self.pending)
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.used() < self.max
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        if now > self.reset_at {
            self.completed = 0;
            self.pending = 0;
            self.reset_at = now + length;
            self.generation += 1;
        }
    }

    fn clear(&mut self, now: Instant, length: Duration) {
        self.completed = 0;
        self.pending = 0;
        self.reset_at = now + length;
        self.generation += 1;
    }
}

#[derive(Debug)]
struct BudgetState {
    global: RateWindow,
    endpoints: HashMap<Arc<str>, RateWindow>,
}

#[derive(Debug)]
struct BudgetInner {
    state: Mutex<BudgetState>,
    window: Duration,
    default_max: u32,
}

/// Per-endpoint and global request budget.
#[derive(Debug, Clone)]
pub struct RateBudget {
    inner: Arc<BudgetInner>,
}

impl RateBudget {
    /// Creates a budget with a per-endpoint default ceiling and a global ceiling per window.
    #[must_use]
    pub fn new(default_max: u32, global_max: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(BudgetInner {
                state: Mutex::new(BudgetState {
                    global: RateWindow::new(global_max, now, window),
                    endpoints: HashMap::new(),
                }),
                window,
                default_max,
            }),
        }
    }

    /// Registers an endpoint window, optionally with its own ceiling.
    pub fn register(&self, endpoint: &Arc<str>, max: Option<u32>) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.endpoints.entry(endpoint.clone()).or_insert_with(|| {
            RateWindow::new(max.unwrap_or(self.inner.default_max), now, self.inner.window)
        });
    }

    pub fn unregister(&self, endpoint: &str) {
        self.inner.state.lock().endpoints.remove(endpoint);
    }

    /// Admits one request against `endpoint` and the global window.
    ///
    /// Returns `None`, without side effects, if either window is full once pending
    /// reservations are counted. Unknown endpoints are registered with the default ceiling.
    #[must_use]
    pub fn try_reserve(&self, endpoint: &Arc<str>) -> Option<Reservation> {
        let now = Instant::now();
        let length = self.inner.window;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        state.global.roll(now, length);
        let default_max = self.inner.default_max;
        let window = state
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(|| RateWindow::new(default_max, now, length));
        window.roll(now, length);

        if !window.has_capacity() || !state.global.has_capacity() {
            trace!(
                endpoint = %endpoint,
                endpoint_used = window.used(),
                global_used = state.global.used(),
                "reservation denied"
            );
            return None;
        }

        window.pending += 1;
        state.global.pending += 1;

        Some(Reservation {
            budget: self.inner.clone(),
            endpoint: endpoint.clone(),
            endpoint_generation: window.generation,
            global_generation: state.global.generation,
            settled: false,
        })
    }

    /// Returns `true` if a reservation against `endpoint` would currently be admitted.
    #[must_use]
    pub fn has_capacity(&self, endpoint: &str) -> bool {
        let now = Instant::now();
        let length = self.inner.window;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        state.global.roll(now, length);
        if !state.global.has_capacity() {
            return false;
        }
        match state.endpoints.get_mut(endpoint) {
            Some(window) => {
                window.roll(now, length);
                window.has_capacity()
            }
            None => self.inner.default_max > 0,
        }
    }

    /// Clears every window. Used by emergency recovery only.
    pub fn reset_all(&self) {
        let now = Instant::now();
        let length = self.inner.window;
        let mut state = self.inner.state.lock();
        state.global.clear(now, length);
        for window in state.endpoints.values_mut() {
            window.clear(now, length);
        }
    }

    #[must_use]
    pub fn endpoint_window(&self, endpoint: &str) -> Option<RateWindow> {
        self.inner.state.lock().endpoints.get(endpoint).copied()
    }

    #[must_use]
    pub fn global_window(&self) -> RateWindow {
        self.inner.state.lock().global
    }
}

/// A provisional accounting entry against an endpoint window and the global window.
///
/// Dropping an unsettled reservation cancels it: the pending slot is returned and
/// nothing is counted as completed.
#[derive(Debug)]
#[must_use = "a reservation is cancelled when dropped"]
pub struct Reservation {
    budget: Arc<BudgetInner>,
    endpoint: Arc<str>,
    endpoint_generation: u64,
    global_generation: u64,
    settled: bool,
}

impl Reservation {
    #[must_use]
    pub fn endpoint(&self) -> &Arc<str> {
        &self.endpoint
    }

    /// Moves the reservation from pending to completed.
    pub fn commit(mut self) {
        self.settle(true);
    }

    /// Discards the reservation after a failed call.
    pub fn release(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, completed: bool) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut guard = self.budget.state.lock();
        let state = &mut *guard;

        if let Some(window) = state.endpoints.get_mut(&self.endpoint) {
            Self::settle_window(window, self.endpoint_generation, completed);
        }
        Self::settle_window(&mut state.global, self.global_generation, completed);
    }

    fn settle_window(window: &mut RateWindow, generation: u64, completed: bool) {
        // A reset already zeroed the pending slot; a completed call still counts now.
        if window.generation == generation {
            window.pending = window.pending.saturating_sub(1);
        }
        if completed {
            window.completed = window.completed.saturating_add(1);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.settle(false);
    }
}
