// Middleware for resilient engine calls
//
// Provides circuit breaking around volatile engines and a global job start limiter

pub mod circuit_breaker;
pub mod rate_limiter;

// Re-export commonly used types
pub use circuit_breaker::{
    BreakerEvent, BreakerRegistry, BreakerReport, BreakerStats, CircuitBreaker,
    CircuitBreakerConfig, CircuitState,
};
pub use rate_limiter::StartLimiter;
