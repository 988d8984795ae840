use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct CircuitBreakerInternalState {
    failure_count: u32,
    opened_at: Option<Instant>,
    state: CircuitBreakerState,
}

impl CircuitBreakerInternalState {
    fn new() -> Self {
        Self { failure_count: 0, opened_at: None, state: CircuitBreakerState::Closed }
    }
}

/// Circuit breaker guarding reconnect attempts.
///
/// Opens after `threshold` consecutive failures and refuses attempts for `cooldown`.
/// Once the cooldown has elapsed the circuit goes half-open with a fresh attempt budget;
/// reaching the threshold again reopens it.
///
/// All state lives under one lock so transitions are atomic.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<CircuitBreakerInternalState>,
    threshold: u32,
    cooldown: Duration,
}

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: failure count reaches threshold
/// - `Open` -> `HalfOpen`: cooldown expires
/// - `HalfOpen` -> `Closed`: success
/// - `HalfOpen` -> `Open`: threshold reached again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(CircuitBreakerInternalState::new()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Checks whether an attempt may proceed.
    ///
    /// # Errors
    ///
    /// Returns the instant the circuit will allow attempts again while it is open.
    pub fn can_attempt(&self) -> Result<(), Instant> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => Ok(()),
            CircuitBreakerState::Open => {
                let retry_at = inner.opened_at.unwrap_or_else(Instant::now) + self.cooldown;
                if Instant::now() < retry_at {
                    return Err(retry_at);
                }
                inner.state = CircuitBreakerState::HalfOpen;
                inner.failure_count = 0;
                tracing::info!("circuit breaker transitioning to half-open state");
                Ok(())
            }
        }
    }

    /// Records a successful attempt and closes the circuit.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitBreakerState::Closed {
            tracing::info!("circuit breaker closed after successful attempt");
        }
        *inner = CircuitBreakerInternalState::new();
    }

    /// Records a failed attempt. Returns the retry instant if this failure opened the circuit.
    pub fn on_failure(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        if inner.state == CircuitBreakerState::Open || inner.failure_count < self.threshold {
            return None;
        }

        let now = Instant::now();
        inner.state = CircuitBreakerState::Open;
        inner.opened_at = Some(now);
        tracing::warn!(
            threshold = self.threshold,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit breaker opened after reaching failure threshold"
        );
        Some(now + self.cooldown)
    }

    /// Reports the state without driving the open to half-open transition.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Instant the open circuit admits attempts again.
    #[must_use]
    pub fn retry_at(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        (inner.state == CircuitBreakerState::Open)
            .then(|| inner.opened_at.map(|at| at + self.cooldown))
            .flatten()
    }
}
