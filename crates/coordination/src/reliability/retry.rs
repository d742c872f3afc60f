//! Typed retry policies and the retry executor.
//!
//! Policies are registered by name and decide, per [`ErrorType`], whether a
//! failed attempt is worth repeating and how long to back off first.

use super::errors::{ErrorStore, ErrorType, WorkflowError};
use crate::events::{SwarmBus, SwarmEvent, SwarmTopic};
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
}

type RetryCondition = Arc<dyn Fn(&WorkflowError) -> bool + Send + Sync>;

/// Named retry policy. Delay grows with the attempt number according to
/// the backoff strategy, clamped to `max_delay`, with optional jitter.
#[derive(Clone)]
pub struct RetryPolicy {
    pub name: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub jitter: bool,
    pub retryable_errors: HashSet<ErrorType>,
    retry_condition: Option<RetryCondition>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("has_condition", &self.retry_condition.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
            retryable_errors: [ErrorType::Network, ErrorType::Timeout, ErrorType::Resource]
                .into_iter()
                .collect(),
            retry_condition: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retryable(mut self, errors: impl IntoIterator<Item = ErrorType>) -> Self {
        self.retryable_errors = errors.into_iter().collect();
        self
    }

    /// Extra predicate consulted after the type check
    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&WorkflowError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn should_retry(&self, error: &WorkflowError) -> bool {
        if !self.retryable_errors.contains(&error.error_type) {
            return false;
        }
        // An explicit condition overrides the error's own flag
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.recoverable,
        }
    }

    /// Backoff before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * attempt as f64,
            BackoffStrategy::Exponential => base_ms * 2f64.powi(attempt as i32 - 1),
            BackoffStrategy::Fibonacci => base_ms * fibonacci(attempt) as f64,
        };
        let clamped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let final_ms = if self.jitter {
            let spread = clamped_ms * 0.3;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (clamped_ms + offset).max(0.0)
        } else {
            clamped_ms
        };
        Duration::from_millis(final_ms as u64)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 1 {
        1
    } else {
        b
    }
}

/// Runs operations under named retry policies
#[derive(Clone)]
pub struct RetryExecutor {
    policies: Arc<DashMap<String, Arc<RetryPolicy>>>,
    errors: ErrorStore,
    events: SwarmBus,
}

impl RetryExecutor {
    pub fn new(events: SwarmBus) -> Self {
        let executor = Self {
            policies: Arc::new(DashMap::new()),
            errors: ErrorStore::default(),
            events,
        };
        executor.install_builtin_policies();
        executor
    }

    fn install_builtin_policies(&self) {
        self.policies
            .insert("default".to_string(), Arc::new(RetryPolicy::new("default")));
        self.policies.insert(
            "aggressive".to_string(),
            Arc::new(
                RetryPolicy::new("aggressive")
                    .max_retries(5)
                    .base_delay(Duration::from_millis(500))
                    .retryable([
                        ErrorType::Network,
                        ErrorType::Timeout,
                        ErrorType::Resource,
                        ErrorType::Integration,
                    ]),
            ),
        );
        self.policies.insert(
            "no-retry".to_string(),
            Arc::new(RetryPolicy::new("no-retry").max_retries(0)),
        );
    }

    pub async fn register_policy(&self, policy: RetryPolicy) {
        let name = policy.name.clone();
        self.policies.insert(name.clone(), Arc::new(policy));
        self.events
            .publish(
                SwarmTopic::PolicyRegistered,
                SwarmEvent::PolicyRegistered { name },
            )
            .await;
    }

    pub fn policy(&self, name: &str) -> Option<Arc<RetryPolicy>> {
        self.policies.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn error_store(&self) -> &ErrorStore {
        &self.errors
    }

    /// Run `operation` under the named policy. Failures are classified and
    /// recorded; the final error carries the last attempt number.
    pub async fn retry<T, E, F, Fut>(
        &self,
        policy_name: &str,
        context: Value,
        operation: F,
    ) -> Result<T, WorkflowError>
    where
        E: fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policy(policy_name).ok_or_else(|| {
            WorkflowError::new(
                ErrorType::Validation,
                format!("unknown retry policy '{policy_name}'"),
            )
            .not_recoverable()
        })?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            policy = %policy.name,
                            attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let error = WorkflowError::classify(&err)
                        .with_attempt(attempt)
                        .with_context(context.clone());
                    self.errors.record(error.clone());

                    if attempt > policy.max_retries {
                        warn!(
                            policy = %policy.name,
                            attempt,
                            error_type = %error.error_type,
                            "retries exhausted"
                        );
                        return Err(error.not_recoverable());
                    }
                    if !policy.should_retry(&error) {
                        warn!(
                            policy = %policy.name,
                            attempt,
                            error_type = %error.error_type,
                            "error not retryable, giving up"
                        );
                        return Err(error.not_recoverable());
                    }

                    let delay = policy.delay_for(attempt);
                    debug!(
                        policy = %policy.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
