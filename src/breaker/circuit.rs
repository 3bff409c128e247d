//! Closed / open / half-open circuit breaker.
//!
//! Failures inside the rolling `failure_window` are counted; reaching
//! `failure_threshold` opens the breaker. Once `recovery_timeout` has
//! elapsed a single half-open trial is admitted: success closes the breaker,
//! failure re-opens it. A success while closed clears the failure count, so
//! the threshold counts consecutive failures.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::errors::CoordinatorError;

/// Tunables for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub failure_window_secs: u64,
}

impl CircuitBreakerConfig {
    pub const fn new(
        failure_threshold: u32,
        recovery_timeout_secs: u64,
        failure_window_secs: u64,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs,
            failure_window_secs,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// Built-in default for a breaker key; unknown keys get the baseline.
    pub fn default_for(key: &str) -> Self {
        match key {
            "phase_two" => Self::new(5, 120, 600),
            "phase_three" => Self::new(4, 90, 450),
            _ => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.failure_window_secs == 0 {
            return Err("failure_window_secs must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(3, 60, 300)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// The breaker refused a call.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker {name} is open")]
pub struct BreakerOpen {
    pub name: String,
    pub retry_after: Duration,
}

impl From<BreakerOpen> for CoordinatorError {
    fn from(open: BreakerOpen) -> Self {
        CoordinatorError::CircuitOpen {
            breaker: open.name,
            retry_after: open.retry_after,
        }
    }
}

/// Error from [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(BreakerOpen),
    #[error("{0}")]
    Inner(E),
}

struct Inner {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Inner {
    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.failures.clear();
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.trial_in_flight = false;
        self.failures.clear();
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window();
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("config", &inner.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                config,
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.lock().config
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Failures currently counted toward the threshold.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.lock();
        inner.prune(Instant::now());
        inner.failures.len()
    }

    /// Ask for permission to make one call.
    pub fn acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerOpen> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self.clone(), false)),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                let recovery = inner.config.recovery_timeout();
                if elapsed >= recovery {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self.clone(), true))
                } else {
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_after: recovery - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self.clone(), true))
                }
            }
        }
    }

    /// Run `call` through the breaker, recording its outcome.
    pub async fn execute<F, Fut, T, E>(self: &Arc<Self>, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(BreakerError::Open)?;
        match call().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Replace the config in place; state and counters carry over.
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.lock().config = config;
    }

    /// Force the breaker open.
    pub fn trip(&self) {
        self.lock().open(Instant::now());
    }

    /// Force the breaker closed and clear its history.
    pub fn reset(&self) {
        self.lock().close();
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial || inner.state == BreakerState::Closed {
            inner.close();
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        if trial {
            inner.open(now);
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }
        inner.failures.push_back(now);
        inner.prune(now);
        if inner.failures.len() >= inner.config.failure_threshold as usize {
            inner.open(now);
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Permission for one call. Record the outcome with `success` or `failure`;
/// dropping it unrecorded frees a half-open trial slot without counting.
#[derive(Debug)]
#[must_use = "record the call outcome with success() or failure()"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    recorded: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            recorded: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.release_trial();
        }
    }
}
