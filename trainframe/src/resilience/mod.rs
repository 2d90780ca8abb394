//! Failure isolation for fallible asynchronous operations.
//!
//! Two generic wrappers guard the pipeline's transport-facing calls:
//!
//! - [`CircuitBreaker`] — fast-fails while a downstream dependency is known
//!   to be unhealthy, instead of piling more work onto it.
//! - [`RetryPolicy`] — re-attempts transient failures with constant or
//!   capped-exponential backoff.
//!
//! Both are applied at the transport-operation boundary (publish/read),
//! where transient failures are most likely. Per-scope frame-computation
//! errors are collected locally and never retried.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use retry::{RetryConfig, RetryPolicy};
