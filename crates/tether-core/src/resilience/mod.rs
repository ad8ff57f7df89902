//! Retry with exponential backoff behind a circuit breaker.
//!
//! Every remote call goes through [`ResiliencePolicy::execute`]. The
//! policy is shared by all workers of a run, so the breaker sees the
//! backend's health across concurrent calls.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::RemoteError;
use crate::cancel::CancelToken;

pub mod breaker;
pub mod clock;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::{RetryPolicy, RetryState};

/// `[resilience]` section of the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_secs: 60,
            max_attempts: 5,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl ResilienceConfig {
    /// Human-readable problems with the configured values.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.failure_threshold == 0 {
            out.push("resilience.failure_threshold must be >= 1".to_string());
        }
        if self.max_attempts == 0 {
            out.push("resilience.max_attempts must be >= 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            out.push("resilience.backoff_factor must be >= 1.0".to_string());
        }
        out
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Retry and circuit-breaker policy wrapped around remote calls.
pub struct ResiliencePolicy {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResiliencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePolicy")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default(), Arc::new(SystemClock::new()))
    }
}

impl ResiliencePolicy {
    #[must_use]
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            breaker,
            retry,
            clock,
        }
    }

    #[must_use]
    pub fn from_config(config: &ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.open_timeout_secs),
            ),
            config.retry_policy(),
            clock,
        )
    }

    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `call` with retries, returning only the outcome.
    ///
    /// # Errors
    ///
    /// See [`execute_traced`](Self::execute_traced).
    pub fn execute<T>(
        &self,
        cancel: &CancelToken,
        call: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.execute_traced(cancel, call).0
    }

    /// Run `call` under the breaker with bounded exponential retry.
    ///
    /// Only transient failures are retried and counted by the breaker; a
    /// non-transient answer proves the backend is reachable and counts as
    /// a breaker success. Cancellation and an open breaker are checked
    /// before every attempt, so neither lets a new call through.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Cancelled`] or [`RemoteError::CircuitOpen`]
    /// when no further attempt may be made, otherwise the last error from
    /// `call`.
    pub fn execute_traced<T>(
        &self,
        cancel: &CancelToken,
        mut call: impl FnMut() -> Result<T, RemoteError>,
    ) -> (Result<T, RemoteError>, RetryState) {
        let start = self.clock.now();
        let mut state = RetryState::default();
        let finish = |state: &mut RetryState| {
            state.elapsed = self.clock.now().saturating_sub(start);
        };

        loop {
            if cancel.is_cancelled() {
                finish(&mut state);
                return (Err(RemoteError::Cancelled), state);
            }
            if !self.breaker.can_execute(self.clock.now()) {
                finish(&mut state);
                return (Err(RemoteError::CircuitOpen), state);
            }

            state.attempts += 1;
            match call() {
                Ok(value) => {
                    self.breaker.record_success();
                    finish(&mut state);
                    return (Ok(value), state);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.record_failure(self.clock.now());
                    if state.attempts >= self.retry.max_attempts {
                        warn!(attempts = state.attempts, error = %err, "remote call failed; retries exhausted");
                        finish(&mut state);
                        return (Err(err), state);
                    }
                    let delay = self.retry.delay_for(state.attempts, err.retry_after());
                    debug!(attempt = state.attempts, ?delay, error = %err, "transient remote failure; backing off");
                    self.clock.sleep(delay);
                    state.waited += delay;
                }
                Err(err) => {
                    self.breaker.record_success();
                    finish(&mut state);
                    return (Err(err), state);
                }
            }
        }
    }
}
