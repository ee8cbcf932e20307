//! Per-link circuit breaker with exponential-backoff cooldowns.
//!
//! Each fallback-chain link owns one [`CircuitBreaker`]. The breaker is the
//! only cross-request mutable state in the core; every compound transition
//! (admission check, success/failure recording) happens under a single lock
//! that is never held across an await point.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Health state of one provider link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; always attempted in chain order.
    Closed,
    /// Cooling down; skipped until the cooldown elapses.
    Open,
    /// Cooldown elapsed; the next attempt is a probe.
    HalfOpen,
}

/// Backoff configuration for circuit cooldowns.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Cooldown after the first failure that opens the circuit.
    pub base_delay: Duration,
    /// Cap for the exponential cooldown.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure.
    pub multiplier: f64,
    /// Consecutive failures before a closed circuit opens.
    pub failure_threshold: u32,
    /// Cap multiplier once the failure count reaches the threshold; a
    /// persistently failing backend gets a much longer cooldown.
    pub degraded_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            failure_threshold: 3,
            degraded_multiplier: 6.0,
        }
    }
}

impl BackoffConfig {
    /// Cooldown for a given consecutive-failure count.
    ///
    /// Exponential, capped at `max_delay` until the failure threshold is
    /// reached, then at `max_delay * degraded_multiplier`.
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let delay_secs =
            self.base_delay.as_secs_f64() * self.multiplier.powi(consecutive_failures as i32);
        let cap = if consecutive_failures >= self.failure_threshold {
            self.max_delay.as_secs_f64() * self.degraded_multiplier
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(delay_secs.min(cap))
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Circuit breaker for one provider link.
///
/// # Invariants
/// - `Open` transitions only to `HalfOpen`, and only after the cooldown elapses
/// - `HalfOpen` goes to `Closed` on the next success and back to `Open` on the
///   next failure
/// - Concurrent outcome reports never produce a lost update (single lock)
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
    config: BackoffConfig,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
            }),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state (for snapshots and logs).
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether the link may be attempted now.
    ///
    /// An open circuit whose cooldown has elapsed transitions to `HalfOpen`
    /// and admits one probe; otherwise it fast-fails without an attempt.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.open_until = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful outcome. Closes the circuit and resets the
    /// failure count.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("Circuit probe succeeded, closing circuit");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    /// Record a failed outcome (after a link exhausts its retries).
    ///
    /// A half-open circuit reopens immediately; a closed circuit opens once
    /// the failure threshold is reached. `retry_after` (from a rate-limit
    /// response) overrides the computed cooldown. Returns the cooldown
    /// applied if the circuit is now open.
    pub fn record_failure(&self, retry_after: Option<Duration>) -> Option<Duration> {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.consecutive_failures >= self.config.failure_threshold
            }
            // A failure reported while already open (an attempt that was in
            // flight when the circuit tripped) changes nothing; the open
            // transition happens exactly once.
            CircuitState::Open => false,
        };

        if should_open {
            let cooldown = retry_after.unwrap_or_else(|| {
                self.config
                    .cooldown_for(inner.consecutive_failures.saturating_sub(1))
            });
            inner.state = CircuitState::Open;
            inner.open_until = Some(Instant::now() + cooldown);
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = cooldown.as_secs_f64(),
                "Circuit opened"
            );
            Some(cooldown)
        } else {
            None
        }
    }
}
