//! Per-provider circuit breaker.
//!
//! ```text
//! Closed   -> Open      failure_count reaches failure_threshold
//! Open     -> HalfOpen  first call after recovery_timeout since opened_at
//! HalfOpen -> Closed    half_open_max_calls trial calls all succeed
//! HalfOpen -> Open      any trial call fails or is abandoned (opened_at is reset)
//! ```
//!
//! The "is it closed" check on the hot path is a single atomic load; every
//! transition happens under the inner mutex.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::metrics;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_seconds() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Returned when a call is refused without reaching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time until the breaker will admit a trial call.
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_permits: u32,
    trial_successes: u32,
    // Bumped on every Open -> HalfOpen so stale permits cannot judge a newer trial window.
    trial_generation: u64,
}

/// Admission to call the backend, resolved with [`CallPermit::succeeded`] or
/// [`CallPermit::failed`].
///
/// A half-open trial permit dropped unresolved (the caller's future was
/// cancelled mid-call) counts as a failed trial and reopens the breaker.
#[must_use = "resolve the permit with `succeeded` or `failed`"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial_generation: Option<u64>,
    resolved: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial_generation.is_some()
    }

    pub fn succeeded(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(generation) = self.trial_generation {
            self.breaker.abandon_trial(generation);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                failure_count: 0,
                opened_at: None,
                trial_permits: 0,
                trial_successes: 0,
                trial_generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: self.state(),
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
        }
    }

    /// Ask permission to call the backend.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        if self.state() == CircuitState::Closed {
            return Ok(self.permit(None));
        }

        let mut inner = self.lock();
        match self.state() {
            CircuitState::Closed => Ok(self.permit(None)),
            CircuitState::Open => {
                let timeout = self.config.recovery_timeout();
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(timeout);
                if elapsed >= timeout {
                    inner.trial_permits = 1;
                    inner.trial_successes = 0;
                    inner.trial_generation += 1;
                    self.transition(CircuitState::HalfOpen);
                    Ok(self.permit(Some(inner.trial_generation)))
                } else {
                    Err(CircuitOpen {
                        retry_after: timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_permits < self.config.half_open_max_calls {
                    inner.trial_permits += 1;
                    Ok(self.permit(Some(inner.trial_generation)))
                } else {
                    // Trial window is full; wait for the verdict.
                    Err(CircuitOpen {
                        retry_after: Duration::from_secs(1),
                    })
                }
            }
        }
    }

    fn permit(&self, trial_generation: Option<u64>) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            trial_generation,
            resolved: false,
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match self.state() {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_max_calls {
                    inner.failure_count = 0;
                    inner.opened_at = None;
                    inner.trial_permits = 0;
                    inner.trial_successes = 0;
                    self.transition(CircuitState::Closed);
                }
            }
            // A call admitted before the breaker opened; it proves nothing.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        self.fail_locked(&mut inner);
    }

    fn abandon_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if self.state() != CircuitState::HalfOpen || inner.trial_generation != generation {
            return;
        }
        tracing::warn!(
            provider = %self.name,
            "Half-open trial call abandoned before completing"
        );
        self.fail_locked(&mut inner);
    }

    fn fail_locked(&self, inner: &mut BreakerInner) {
        match self.state() {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.opened_at = Some(Instant::now());
                inner.trial_permits = 0;
                inner.trial_successes = 0;
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Force the breaker closed, e.g. after an operator confirms recovery.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_permits = 0;
        inner.trial_successes = 0;
        if self.state() != CircuitState::Closed {
            self.transition(CircuitState::Closed);
        }
    }

    // Caller must hold the inner lock.
    fn transition(&self, to: CircuitState) {
        let from = CircuitState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        if from == to {
            return;
        }
        match to {
            CircuitState::Open => tracing::warn!(
                provider = %self.name,
                from = from.as_str(),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                provider = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }
        metrics::record_circuit_transition(&self.name, to.as_str());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_secs: u64, trials: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "directory",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_seconds: timeout_secs,
                half_open_max_calls: trials,
            },
        )
    }

    fn fail_times(breaker: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            breaker.try_acquire().unwrap().failed();
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(3, 60, 1);
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_times(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = breaker(3, 60, 1);
        fail_times(&breaker, 2);
        breaker.try_acquire().unwrap().succeeded();
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[test]
    fn dropped_permit_in_closed_state_changes_nothing() {
        let breaker = breaker(1, 60, 1);
        let permit = breaker.try_acquire().unwrap();
        assert!(!permit.is_trial());
        drop(permit);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_all_trials_succeed() {
        let breaker = breaker(1, 60, 3);
        fail_times(&breaker, 1);
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;

        let mut trials: Vec<_> = (0..3).map(|_| breaker.try_acquire().unwrap()).collect();
        assert!(trials.iter().all(|p| p.is_trial()));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Trial window is exhausted until verdicts come in.
        assert!(breaker.try_acquire().is_err());

        trials.pop().unwrap().succeeded();
        trials.pop().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        trials.pop().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_timer() {
        let breaker = breaker(1, 60, 2);
        fail_times(&breaker, 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        breaker.try_acquire().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let refused = breaker.try_acquire().unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_reopens_instead_of_holding_the_slot() {
        let breaker = breaker(1, 60, 1);
        fail_times(&breaker, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.try_acquire().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_trial_permit_does_not_judge_a_newer_window() {
        let breaker = breaker(1, 60, 2);
        fail_times(&breaker, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        drop(stale);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fresh.succeeded();
        breaker.try_acquire().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_refuses_until_timeout_elapses() {
        let breaker = breaker(2, 10, 1);
        fail_times(&breaker, 2);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        trial.succeeded();
    }

    #[test]
    fn reset_closes_an_open_breaker() {
        let breaker = breaker(1, 600, 1);
        fail_times(&breaker, 1);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
