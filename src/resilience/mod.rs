pub mod breaker;

pub use breaker::{BreakerConfig, BreakerError, BreakerSnapshot, CircuitBreaker};
