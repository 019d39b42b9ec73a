//! Resilience primitives guarding dependencies and the request surface.

pub mod batcher;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use batcher::{PendingRequest, Processor, RequestBatcher, RequestStatus};
pub use circuit_breaker::{
    BreakerOutcome, CircuitBreaker, CircuitBreakerSnapshot, CircuitState, Fallback,
};
pub use rate_limiter::{DEFAULT_ENDPOINT, RateLimitDecision, RateLimiter};
