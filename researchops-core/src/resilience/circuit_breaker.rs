//! Circuit breaker guarding a single external dependency.
//!
//! ```text
//! Closed   --fail_max failures-->          Open
//! Open     --timeout elapsed, next call--> HalfOpen
//! HalfOpen --success_threshold successes-> Closed
//! HalfOpen --any counted failure-->        Open
//! ```
//!
//! Calls return an explicit [`BreakerOutcome`] instead of using errors for
//! control flow, so callers branch on success, fallback, failure, or rejection.
//! Failures whose [`ErrorKind`] is excluded (caller input errors, by default)
//! pass through without touching the counters.

use crate::config::CircuitBreakerConfig;
use crate::error::{CircuitBreakerOpen, ErrorKind, ResearchOpsError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation. Calls are permitted.
    Closed,
    /// Too many failures. Calls are rejected without being attempted.
    Open,
    /// Recovery trial. Calls are permitted and their outcome decides the next state.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Diagnostic snapshot returned by [`CircuitBreaker::get_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Value used in place of the operation's result when the breaker will not
/// (or could not) produce one.
pub enum Fallback<T> {
    /// Returned as-is.
    Value(T),
    /// Invoked to produce the value.
    Call(Box<dyn FnOnce() -> T + Send>),
}

impl<T> Fallback<T> {
    pub fn value(value: T) -> Self {
        Fallback::Value(value)
    }

    pub fn call(f: impl FnOnce() -> T + Send + 'static) -> Self {
        Fallback::Call(Box::new(f))
    }

    fn resolve(self) -> T {
        match self {
            Fallback::Value(value) => value,
            Fallback::Call(f) => f(),
        }
    }
}

impl<T> std::fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fallback::Value(_) => f.write_str("Fallback::Value(..)"),
            Fallback::Call(_) => f.write_str("Fallback::Call(..)"),
        }
    }
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum BreakerOutcome<T> {
    /// The operation ran and succeeded.
    Success(T),
    /// The fallback was used, either because the circuit was open or because
    /// the operation failed with a counted error.
    Fallback(T),
    /// The operation ran and failed, and no fallback was supplied (or the
    /// failure kind is excluded).
    Failed(ResearchOpsError),
    /// The circuit is open and no fallback was supplied.
    Rejected(CircuitBreakerOpen),
}

impl<T> BreakerOutcome<T> {
    /// Collapse into a `Result`, treating fallback values as success.
    pub fn into_result(self) -> Result<T> {
        match self {
            BreakerOutcome::Success(value) | BreakerOutcome::Fallback(value) => Ok(value),
            BreakerOutcome::Failed(err) => Err(err),
            BreakerOutcome::Rejected(open) => Err(open.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BreakerOutcome::Success(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, BreakerOutcome::Fallback(_))
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

enum Permit {
    Granted,
    Denied(CircuitBreakerOpen),
}

/// A circuit breaker protecting one dependency.
///
/// Shared between callers via `Arc`. Every check-and-update happens inside a
/// single short critical section; the lock is never held while the guarded
/// operation is awaited.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    fail_max: u32,
    timeout: Duration,
    success_threshold: u32,
    excluded_kinds: HashSet<ErrorKind>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            fail_max: config.fail_max.max(1),
            timeout: config.timeout(),
            success_threshold: config.success_threshold.max(1),
            excluded_kinds: config.excluded_kinds.iter().copied().collect(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Does not perform the Open -> HalfOpen transition;
    /// that only happens when a call arrives.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Diagnostic snapshot of the breaker.
    pub fn get_state(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Whether errors of this kind bypass the breaker.
    pub fn is_excluded(&self, kind: ErrorKind) -> bool {
        self.excluded_kinds.contains(&kind)
    }

    /// Run `operation` under the breaker.
    pub async fn call<T, F, Fut>(
        &self,
        operation: F,
        fallback: Option<Fallback<T>>,
    ) -> BreakerOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Permit::Denied(open) = self.acquire() {
            return match fallback {
                Some(fallback) => {
                    debug!(breaker = %self.name, "Circuit open, using fallback");
                    BreakerOutcome::Fallback(fallback.resolve())
                }
                None => BreakerOutcome::Rejected(open),
            };
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                BreakerOutcome::Success(value)
            }
            Err(err) if self.is_excluded(err.kind()) => {
                debug!(
                    breaker = %self.name,
                    kind = %err.kind(),
                    "Excluded failure, breaker untouched"
                );
                BreakerOutcome::Failed(err)
            }
            Err(err) => {
                self.on_failure(&err);
                match fallback {
                    Some(fallback) => BreakerOutcome::Fallback(fallback.resolve()),
                    None => BreakerOutcome::Failed(err),
                }
            }
        }
    }

    /// Run `operation` without a fallback and return a plain `Result`.
    pub async fn call_guarded<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call(operation, None).await.into_result()
    }

    /// Force the breaker back to `Closed` (manual recovery).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen once the
    /// timeout has elapsed.
    fn acquire(&self) -> Permit {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Permit::Granted;
        }

        let elapsed = inner
            .last_failure_time
            .map(|t| t.elapsed())
            .unwrap_or(self.timeout);
        if elapsed >= self.timeout {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.failure_count = 0;
            info!(breaker = %self.name, "Circuit breaker half-open, probing dependency");
            Permit::Granted
        } else {
            Permit::Denied(CircuitBreakerOpen {
                name: self.name.clone(),
                retry_after: self.timeout.saturating_sub(elapsed),
            })
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    info!(breaker = %self.name, "Circuit breaker closed after recovery");
                }
            }
            // A call admitted before the circuit opened; the open period stands.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, err: &ResearchOpsError) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.fail_max {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        threshold = self.fail_max,
                        error = %err,
                        "Circuit breaker opening"
                    );
                    self.trip(&mut inner);
                } else {
                    debug!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        error = %err,
                        "Dependency failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    error = %err,
                    "Trial call failed, circuit breaker re-opening"
                );
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.last_failure_time = Some(Instant::now());
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
