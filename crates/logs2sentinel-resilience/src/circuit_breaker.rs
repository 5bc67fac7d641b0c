//! Three-state circuit breaker
//!
//! closed → open when consecutive failures reach `failure_threshold` (and at
//! least `min_calls_before_open` calls were observed); open → half_open once
//! `recovery_timeout` has elapsed and a call arrives; half_open → closed
//! after `success_threshold` successes, or back → open on any failure.
//!
//! State transitions happen under a lock; the guarded future runs outside
//! it. A bounded history of the last 100 transitions is kept for
//! observability.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

const TRANSITION_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub half_open_max_inflight: u32,
    pub min_calls_before_open: u32,
    pub operation_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_inflight: 3,
            min_calls_before_open: 10,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Error surface of [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open for '{service}' since {opened_at}; retry in {retry_after:?}")]
    Open {
        service: String,
        opened_at: DateTime<Utc>,
        retry_after: Duration,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    half_open_calls: u32,
    opened_at_instant: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    transitions: VecDeque<Transition>,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if self.transitions.len() == TRANSITION_HISTORY_LIMIT {
            self.transitions.pop_front();
        }
        self.transitions.push_back(Transition {
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// Failure gate around one remote dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            service = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs(),
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                half_open_calls: 0,
                opened_at_instant: None,
                opened_at: None,
                transitions: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            opened_at: inner.opened_at,
        }
    }

    /// Recorded state changes, oldest first (bounded to the last 100).
    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    /// Execute `fut` through the breaker. Fails fast with
    /// [`CircuitError::Open`] while the circuit is open; otherwise runs the
    /// future under `operation_timeout` and feeds the outcome back into the
    /// state machine. The inner error is handed back to the caller after the
    /// state update.
    pub async fn call<T, E, Fut>(&self, fut: Fut) -> Result<T, CircuitError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let admitted_half_open = self.admit()?;

        let result = tokio::time::timeout(self.config.operation_timeout, fut).await;

        match result {
            Ok(Ok(value)) => {
                self.on_success(admitted_half_open);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(admitted_half_open);
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                tracing::warn!(
                    service = %self.name,
                    timeout_secs = self.config.operation_timeout.as_secs_f64(),
                    "circuit breaker operation timeout"
                );
                self.on_failure(admitted_half_open);
                Err(CircuitError::Timeout(self.config.operation_timeout))
            }
        }
    }

    /// Returns whether the call was admitted as a half-open test call.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at_instant
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.recovery_timeout {
                tracing::info!(service = %self.name, "circuit breaker half-open, testing recovery");
                inner.transition(CircuitState::HalfOpen);
                inner.success_count = 0;
                inner.half_open_calls = 0;
            } else {
                return Err(self.open_error(&inner, elapsed));
            }
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_calls >= self.config.half_open_max_inflight {
                let elapsed = inner
                    .opened_at_instant
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                return Err(self.open_error(&inner, elapsed));
            }
            inner.half_open_calls += 1;
            return Ok(true);
        }

        Ok(false)
    }

    fn open_error<E>(&self, inner: &Inner, elapsed: Duration) -> CircuitError<E> {
        CircuitError::Open {
            service: self.name.clone(),
            opened_at: inner.opened_at.unwrap_or_else(Utc::now),
            retry_after: self.config.recovery_timeout.saturating_sub(elapsed),
        }
    }

    fn on_success(&self, was_half_open: bool) {
        let mut inner = self.inner.lock();
        if was_half_open {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(service = %self.name, "circuit breaker closed, recovery complete");
                    inner.transition(CircuitState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.opened_at_instant = None;
                } else {
                    tracing::debug!(
                        service = %self.name,
                        successes = inner.success_count,
                        needed = self.config.success_threshold,
                        "circuit breaker half-open success"
                    );
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, was_half_open: bool) {
        let mut inner = self.inner.lock();
        if was_half_open {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(service = %self.name, "circuit breaker reopened, recovery failed");
                self.open(&mut inner);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold
                    && inner.total_calls >= u64::from(self.config.min_calls_before_open)
                {
                    tracing::warn!(
                        service = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.transition(CircuitState::Open);
        inner.opened_at = Some(Utc::now());
        inner.opened_at_instant = Some(Instant::now());
        inner.success_count = 0;
        inner.half_open_calls = 0;
    }
}
