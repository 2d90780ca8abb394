//! Circuit breaker for fallible async operations.
//!
//! # State Machine
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[open_timeout elapsed]--> HalfOpen (next call is attempted)
//! HalfOpen --[success]--> Closed (failure count reset)
//! HalfOpen --[failure]--> Open (timer restarts)
//! ```
//!
//! While `Open` and before the retry time, [`CircuitBreaker::execute`] fails
//! immediately with [`BreakerError::Open`] without invoking the wrapped
//! operation. Operation errors are passed through unchanged after
//! bookkeeping.
//!
//! # Thread Safety
//!
//! Interior mutability via `parking_lot::Mutex`; the breaker is shared
//! across tasks behind an `Arc`.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default consecutive-failure threshold before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the circuit stays open before a probe call is allowed.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit (default: 5).
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe (default: 30s).
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Fast-failing; calls are rejected until the open timeout elapses.
    Open,
    /// Probing; the next call is attempted and decides the outcome.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error, PartialEq)]
pub enum BreakerError<E> {
    /// The circuit is open; the wrapped operation was not invoked.
    #[error("circuit breaker open, retry in {retry_in:?}")]
    Open { retry_in: Duration },

    /// The wrapped operation failed; its error is passed through unchanged.
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Unwrap the operation error, if this is not a fast-fail.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

/// Read-only view of breaker state and counters.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_retry_at: None,
        }
    }
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// Fast-fails with [`BreakerError::Open`] while the circuit is open and
    /// the retry time has not elapsed; otherwise invokes the operation,
    /// updates state per the transition table, and passes any operation
    /// error through unchanged.
    pub async fn execute<T, E, F>(&self, context: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.admit(context)?;

        match operation.await {
            Ok(value) => {
                self.record_success(context);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(context, &error);
                Err(BreakerError::Operation(error))
            }
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
        debug!("circuit breaker reset to closed");
    }

    /// Read-only state and counters for observability.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            next_retry_at: inner.next_retry_at,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Decide whether a call may proceed, moving open → half-open when the
    /// timeout has elapsed.
    fn admit<E>(&self, context: &str) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_retry_at {
                    Some(retry_at) if now < retry_at => Err(BreakerError::Open {
                        retry_in: retry_at - now,
                    }),
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        info!(context, "circuit breaker half-open, probing");
                        Ok(())
                    }
                }
            }
        }
    }

    fn record_success(&self, context: &str) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(context, "circuit breaker closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_retry_at = None;
    }

    fn record_failure<E: fmt::Display>(&self, context: &str, error: &E) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold;

        if should_open {
            inner.state = CircuitState::Open;
            inner.next_retry_at = Some(Instant::now() + self.config.open_timeout);
            warn!(
                context,
                failures = inner.failure_count,
                open_timeout_ms = self.config.open_timeout.as_millis() as u64,
                %error,
                "circuit breaker opened"
            );
        } else {
            debug!(
                context,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                %error,
                "circuit breaker recorded failure"
            );
        }
    }
}
