use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::Provider;

/// Configuration for a provider circuit breaker.
///
/// - **Failure threshold**: 5 failures without an intervening success trips the breaker.
/// - **Reset window**: 60s after the last failure the next call is let through as a trial call.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Point-in-time view of a breaker for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: Provider,
    pub state: CircuitState,
    pub failure_count: u32,
    pub seconds_since_last_failure: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

/// Per-provider failure gate.
///
/// # States
///
/// - **CLOSED**: calls pass through.
/// - **OPEN**: `failure_count >= threshold` and the last failure is younger than
///   the reset window; calls fail fast without network I/O.
/// - **HALF_OPEN**: implicit. Once the window has elapsed `is_open` resets the
///   counter and the next call's outcome decides the state.
///
/// State is process-local; each replica throttles on its own.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: Provider,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for one provider.
    ///
    /// # Arguments
    ///
    /// * `provider` - Provider whose calls this breaker gates.
    /// * `config` - Failure threshold and reset window.
    pub fn new(provider: Provider, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Whether calls should fail fast right now.
    ///
    /// Once the reset window has passed since the last failure the counter is
    /// cleared and `false` is returned, letting one trial call through.
    ///
    /// # Returns
    ///
    /// * `bool` - `true` while the threshold is reached and the window has not elapsed.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// Closes the breaker and clears the failure count.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.failure_count > 0 {
            tracing::info!(
                "Circuit breaker for {} reset after success ({} prior failures)",
                self.provider,
                state.failure_count
            );
        }
        state.failure_count = 0;
        state.last_failure_at = None;
    }

    /// Counts one failed call. Reaching the threshold opens the breaker for
    /// one reset window.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Current state for the status endpoint.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let open = self.is_open_at(now);
        let state = self.lock();
        BreakerSnapshot {
            provider: self.provider,
            state: if open {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            failure_count: state.failure_count,
            seconds_since_last_failure: state
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_secs()),
        }
    }

    pub(crate) fn is_open_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if state.failure_count < self.config.failure_threshold {
            return false;
        }
        match state.last_failure_at {
            Some(at) if now.saturating_duration_since(at) < self.config.reset_window => true,
            _ => {
                tracing::info!(
                    "Circuit breaker for {} entering half-open after {:?}",
                    self.provider,
                    self.config.reset_window
                );
                state.failure_count = 0;
                false
            }
        }
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);
        if state.failure_count == self.config.failure_threshold {
            tracing::warn!(
                "Circuit breaker for {} opened after {} failures",
                self.provider,
                state.failure_count
            );
        }
    }

    // Counters are advisory; a poisoned lock still holds usable numbers.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Provider::Meta, CircuitBreakerConfig::default())
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker();
        let start = Instant::now();

        for _ in 0..4 {
            cb.record_failure_at(start);
        }
        assert!(!cb.is_open_at(start));

        cb.record_failure_at(start);
        assert!(cb.is_open_at(start + Duration::from_secs(1)));
        assert!(cb.is_open_at(start + Duration::from_secs(59)));
    }

    #[test]
    fn test_reset_window_moves_to_half_open() {
        let cb = breaker();
        let start = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at(start);
        }

        assert!(!cb.is_open_at(start + Duration::from_secs(60)));
        assert_eq!(cb.snapshot().failure_count, 0);

        // A failed trial call starts counting again from zero.
        cb.record_failure_at(start + Duration::from_secs(61));
        assert!(!cb.is_open_at(start + Duration::from_secs(62)));
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker();
        let start = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at(start);
        }
        assert!(cb.is_open_at(start));

        cb.record_success();
        assert!(!cb.is_open_at(start));
        assert_eq!(cb.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn test_custom_threshold() {
        let cb = CircuitBreaker::new(
            Provider::TikTok,
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_window: Duration::from_secs(10),
            },
        );
        let start = Instant::now();
        cb.record_failure_at(start);
        cb.record_failure_at(start);
        assert!(cb.is_open_at(start + Duration::from_secs(9)));
        assert!(!cb.is_open_at(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_snapshot_reports_open_state() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 5);
        assert_eq!(snapshot.provider, Provider::Meta);
    }
}
