//! Declarative recovery plans.
//!
//! A plan binds a set of error types (plus an optional predicate) to an
//! ordered action list. The manager picks the highest-priority enabled
//! plan matching an error and walks its actions: `Skip` and `Fallback`
//! resolve immediately, `Compensate` runs its steps in `order`, the rest
//! are delegated to a caller-supplied executor. A failing action aborts
//! the plan.

use super::errors::{ErrorType, WorkflowError};
use crate::events::{SwarmBus, SwarmEvent, SwarmTopic};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CompensationStep {
    pub name: String,
    pub order: u32,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Re-run the failed operation under the named retry policy
    Retry { policy: String },
    /// Drop the failed operation and continue
    Skip,
    /// Resolve with a substitute value
    Fallback { value: Value },
    /// Undo prior side effects, steps executed in ascending `order`
    Compensate { steps: Vec<CompensationStep> },
    /// Hand the failure to a human or supervising system
    Escalate { target: String },
    /// Rewrite the failed operation's input and re-run
    Transform { transformation: String },
}

impl RecoveryAction {
    fn label(&self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Fallback { .. } => "fallback",
            RecoveryAction::Compensate { .. } => "compensate",
            RecoveryAction::Escalate { .. } => "escalate",
            RecoveryAction::Transform { .. } => "transform",
        }
    }
}

type PlanCondition = Arc<dyn Fn(&WorkflowError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RecoveryPlan {
    pub id: Uuid,
    pub name: String,
    pub error_types: HashSet<ErrorType>,
    pub priority: u32,
    pub enabled: bool,
    pub actions: Vec<RecoveryAction>,
    condition: Option<PlanCondition>,
}

impl fmt::Debug for RecoveryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryPlan")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl RecoveryPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            error_types: HashSet::new(),
            priority: 0,
            enabled: true,
            actions: Vec::new(),
            condition: None,
        }
    }

    pub fn for_errors(mut self, errors: impl IntoIterator<Item = ErrorType>) -> Self {
        self.error_types = errors.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn action(mut self, action: RecoveryAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&WorkflowError) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    fn matches(&self, error: &WorkflowError) -> bool {
        if !self.enabled || !self.error_types.contains(&error.error_type) {
            return false;
        }
        match &self.condition {
            Some(condition) => condition(error),
            None => true,
        }
    }
}

/// Caller-supplied execution of non-trivial recovery actions
#[async_trait]
pub trait RecoveryActionExecutor: Send + Sync {
    async fn run_action(
        &self,
        action: &RecoveryAction,
        error: &WorkflowError,
    ) -> anyhow::Result<()>;

    async fn compensate(
        &self,
        step: &CompensationStep,
        error: &WorkflowError,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// No enabled plan matched the error
    Unhandled,
    /// All plan actions ran to completion
    Recovered,
    /// A `Skip` action resolved the failure
    Skipped,
    /// A `Fallback` action resolved the failure with a value
    Fallback(Value),
    /// An action failed; remaining actions were not run
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub plan: Option<String>,
    pub outcome: RecoveryOutcome,
    pub executed_actions: Vec<String>,
}

#[derive(Clone)]
pub struct RecoveryManager {
    plans: Arc<RwLock<Vec<RecoveryPlan>>>,
    events: SwarmBus,
}

impl RecoveryManager {
    pub fn new(events: SwarmBus) -> Self {
        Self {
            plans: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub async fn register_plan(&self, plan: RecoveryPlan) {
        let name = plan.name.clone();
        self.plans.write().await.push(plan);
        info!(plan = %name, "recovery plan registered");
        self.events
            .publish(
                SwarmTopic::RecoveryPlanRegistered,
                SwarmEvent::RecoveryPlanRegistered { name },
            )
            .await;
    }

    pub async fn plan_count(&self) -> usize {
        self.plans.read().await.len()
    }

    /// Select and execute the best matching plan for the error
    pub async fn recover(
        &self,
        error: &WorkflowError,
        executor: &dyn RecoveryActionExecutor,
    ) -> RecoveryResult {
        let plan = {
            let plans = self.plans.read().await;
            plans
                .iter()
                .filter(|p| p.matches(error))
                .max_by_key(|p| p.priority)
                .cloned()
        };

        let Some(plan) = plan else {
            debug!(error_type = %error.error_type, "no recovery plan matched");
            return RecoveryResult {
                plan: None,
                outcome: RecoveryOutcome::Unhandled,
                executed_actions: Vec::new(),
            };
        };

        debug!(plan = %plan.name, error_type = %error.error_type, "recovery plan selected");
        let mut executed = Vec::new();
        for action in &plan.actions {
            match action {
                RecoveryAction::Skip => {
                    executed.push(action.label().to_string());
                    return RecoveryResult {
                        plan: Some(plan.name),
                        outcome: RecoveryOutcome::Skipped,
                        executed_actions: executed,
                    };
                }
                RecoveryAction::Fallback { value } => {
                    executed.push(action.label().to_string());
                    return RecoveryResult {
                        plan: Some(plan.name),
                        outcome: RecoveryOutcome::Fallback(value.clone()),
                        executed_actions: executed,
                    };
                }
                RecoveryAction::Compensate { steps } => {
                    let mut ordered: Vec<&CompensationStep> = steps.iter().collect();
                    ordered.sort_by_key(|s| s.order);
                    for step in ordered {
                        if let Err(err) = executor.compensate(step, error).await {
                            warn!(plan = %plan.name, step = %step.name, error = %err, "compensation failed");
                            return RecoveryResult {
                                plan: Some(plan.name),
                                outcome: RecoveryOutcome::Failed(err.to_string()),
                                executed_actions: executed,
                            };
                        }
                    }
                    executed.push(action.label().to_string());
                }
                other => {
                    if let Err(err) = executor.run_action(other, error).await {
                        warn!(plan = %plan.name, action = other.label(), error = %err, "recovery action failed");
                        return RecoveryResult {
                            plan: Some(plan.name),
                            outcome: RecoveryOutcome::Failed(err.to_string()),
                            executed_actions: executed,
                        };
                    }
                    executed.push(other.label().to_string());
                }
            }
        }

        RecoveryResult {
            plan: Some(plan.name),
            outcome: RecoveryOutcome::Recovered,
            executed_actions: executed,
        }
    }
}
