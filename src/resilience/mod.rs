//! Fault-tolerance layer: circuit breaker and retry driver.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{retry_with_backoff, RetryConfig};
