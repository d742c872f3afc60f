//! Reliability Integration Tests
//!
//! Wires the resilience primitives together the way a swarm runtime
//! would:
//! - retry executor healing a flaky operation under a named policy
//! - circuit breaker lifecycle observed on the event bus
//! - recovery plans delegating the retry action back to the executor

use async_trait::async_trait;
use coordination::events::{SwarmEvent, SwarmTopic};
use coordination::reliability::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, CompensationStep,
    ErrorType, RecoveryAction, RecoveryActionExecutor, RecoveryManager, RecoveryOutcome,
    RecoveryPlan, RetryExecutor, RetryPolicy, WorkflowError,
};
use coordination::SwarmBus;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn aggressive_policy_outlasts_a_flaky_upstream() {
    let executor = RetryExecutor::new(SwarmBus::default());
    executor
        .register_policy(
            RetryPolicy::new("impatient")
                .max_retries(5)
                .base_delay(Duration::from_millis(1))
                .strategy(BackoffStrategy::Fixed)
                .jitter(false)
                .retryable([ErrorType::Network, ErrorType::Integration]),
        )
        .await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = executor
        .retry("impatient", json!({"upstream": "inventory"}), move || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("connection refused".to_string()),
                    1 => Err("upstream returned 503".to_string()),
                    _ => Ok("fresh inventory".to_string()),
                }
            }
        })
        .await;

    assert_eq!(result.expect("third call succeeds"), "fresh inventory");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Both failures were classified and recorded
    let counts = executor.error_store().counts_by_type();
    assert_eq!(counts[&ErrorType::Network], 1);
    assert_eq!(counts[&ErrorType::Integration], 1);
}

#[tokio::test]
async fn circuit_lifecycle_is_published_on_the_bus() {
    let bus = SwarmBus::default();
    let mut open_rx = bus.subscribe(SwarmTopic::CircuitOpen).await;
    let mut half_open_rx = bus.subscribe(SwarmTopic::CircuitHalfOpen).await;
    let mut close_rx = bus.subscribe(SwarmTopic::CircuitClose).await;

    let breaker = CircuitBreaker::new(
        "inventory-fetch",
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            half_open_max_requests: 2,
            ..Default::default()
        },
        bus,
    );

    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), _>("connection refused") })
            .await;
    }
    let envelope = timeout(Duration::from_secs(1), open_rx.recv())
        .await
        .expect("open event")
        .expect("recv");
    assert!(matches!(
        envelope.payload,
        SwarmEvent::CircuitOpen { ref operation } if operation == "inventory-fetch"
    ));

    // Rejected while open, without running the operation
    let rejected = breaker.execute(|| async { Ok::<_, String>(()) }).await;
    assert!(rejected.is_err());

    let envelope = timeout(Duration::from_secs(1), half_open_rx.recv())
        .await
        .expect("half-open event")
        .expect("recv");
    assert!(matches!(envelope.payload, SwarmEvent::CircuitHalfOpen { .. }));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    for _ in 0..2 {
        breaker
            .execute(|| async { Ok::<_, String>(()) })
            .await
            .expect("probe succeeds");
    }
    let envelope = timeout(Duration::from_secs(1), close_rx.recv())
        .await
        .expect("close event")
        .expect("recv");
    assert!(matches!(envelope.payload, SwarmEvent::CircuitClosed { .. }));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Delegates `Retry` actions back to the retry executor, records the rest
struct SwarmRecoveryExecutor {
    retries: RetryExecutor,
    operation: Arc<AtomicU32>,
    log: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl RecoveryActionExecutor for SwarmRecoveryExecutor {
    async fn run_action(
        &self,
        action: &RecoveryAction,
        error: &WorkflowError,
    ) -> anyhow::Result<()> {
        match action {
            RecoveryAction::Retry { policy } => {
                let counter = self.operation.clone();
                self.retries
                    .retry(policy, json!({"recovering": error.id}), move || {
                        let counter = counter.clone();
                        async move {
                            if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                                Err("connection refused")
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await?;
                self.log.lock().push("retry".to_string());
                Ok(())
            }
            RecoveryAction::Escalate { target } => {
                self.log.lock().push(format!("escalate:{target}"));
                Ok(())
            }
            other => anyhow::bail!("unsupported action {other:?}"),
        }
    }

    async fn compensate(
        &self,
        step: &CompensationStep,
        _error: &WorkflowError,
    ) -> anyhow::Result<()> {
        self.log.lock().push(format!("compensate:{}", step.name));
        Ok(())
    }
}

#[tokio::test]
async fn recovery_plan_retries_through_the_executor() {
    let bus = SwarmBus::default();
    let retries = RetryExecutor::new(bus.clone());
    retries
        .register_policy(
            RetryPolicy::new("quick")
                .max_retries(3)
                .base_delay(Duration::from_millis(1))
                .jitter(false),
        )
        .await;

    let manager = RecoveryManager::new(bus);
    manager
        .register_plan(
            RecoveryPlan::new("network-recovery")
                .for_errors([ErrorType::Network])
                .priority(10)
                .action(RecoveryAction::Compensate {
                    steps: vec![CompensationStep {
                        name: "release-claim".into(),
                        order: 1,
                        params: Value::Null,
                    }],
                })
                .action(RecoveryAction::Retry {
                    policy: "quick".into(),
                }),
        )
        .await;

    let executor = SwarmRecoveryExecutor {
        retries,
        operation: Arc::new(AtomicU32::new(0)),
        log: parking_lot::Mutex::new(Vec::new()),
    };

    let error = WorkflowError::new(ErrorType::Network, "connection refused");
    let result = manager.recover(&error, &executor).await;

    assert_eq!(result.plan.as_deref(), Some("network-recovery"));
    assert_eq!(result.outcome, RecoveryOutcome::Recovered);
    assert_eq!(
        *executor.log.lock(),
        vec!["compensate:release-claim".to_string(), "retry".to_string()]
    );
}

#[tokio::test]
async fn fallback_plan_resolves_without_touching_the_executor() {
    let manager = RecoveryManager::new(SwarmBus::default());
    manager
        .register_plan(
            RecoveryPlan::new("serve-stale")
                .for_errors([ErrorType::Timeout, ErrorType::Integration])
                .action(RecoveryAction::Fallback {
                    value: json!({"source": "cache", "stale": true}),
                }),
        )
        .await;

    let executor = SwarmRecoveryExecutor {
        retries: RetryExecutor::new(SwarmBus::default()),
        operation: Arc::new(AtomicU32::new(0)),
        log: parking_lot::Mutex::new(Vec::new()),
    };

    let error = WorkflowError::new(ErrorType::Timeout, "operation timed out");
    let result = manager.recover(&error, &executor).await;
    match result.outcome {
        RecoveryOutcome::Fallback(value) => assert_eq!(value["source"], json!("cache")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(executor.log.lock().is_empty());
}
