//! Circuit breakers gating phase starts and nested transitions.

pub mod circuit;
pub mod manager;

pub use circuit::{
    BreakerError, BreakerOpen, BreakerPermit, BreakerState, CircuitBreaker, CircuitBreakerConfig,
};
pub use manager::{
    BREAKER_CONFIG_KEY, BreakerSnapshot, CircuitBreakerManager, TRANSITION_BREAKER,
};
