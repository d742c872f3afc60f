//! Resilience primitives: error taxonomy, typed retries, circuit
//! breaking and declarative recovery plans.

pub mod circuit_breaker;
pub mod errors;
pub mod recovery;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use errors::{ErrorSeverity, ErrorStore, ErrorType, WorkflowError};
pub use recovery::{
    CompensationStep, RecoveryAction, RecoveryActionExecutor, RecoveryManager, RecoveryOutcome,
    RecoveryPlan, RecoveryResult,
};
pub use retry::{BackoffStrategy, RetryExecutor, RetryPolicy};
