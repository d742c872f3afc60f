//! Canonical event topics and payloads for the coordination core.
//!
//! Every component publishes to the shared [`SwarmBus`]; external
//! collaborators (coordinating agent, persistence, progress tracking)
//! subscribe to the topics they care about. Publishing is fire-and-forget
//! with multiple-subscriber semantics.

use common::event_bus::EventBus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Topics a component can publish to or subscribe on. Grouped by the
/// module that emits them; one broadcast channel exists per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwarmTopic {
    // Voting engine
    VotingStarted,
    VoteCast,
    VotingClosed,
    TieBreakNeeded,
    DecisionDeferred,
    // Messaging protocol
    AgentRegistered,
    MessageSent,
    MessageRetry,
    AckTimeout,
    AcksReceived,
    DeliveryFailure,
    ProtocolError,
    // Resilience
    PolicyRegistered,
    RecoveryPlanRegistered,
    CircuitOpen,
    CircuitClose,
    CircuitHalfOpen,
}

impl SwarmTopic {
    /// Dotted form used in logs and external routing keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwarmTopic::VotingStarted => "voting.started",
            SwarmTopic::VoteCast => "voting.cast",
            SwarmTopic::VotingClosed => "voting.closed",
            SwarmTopic::TieBreakNeeded => "voting.tie_break_needed",
            SwarmTopic::DecisionDeferred => "voting.deferred",
            SwarmTopic::AgentRegistered => "protocol.agent_registered",
            SwarmTopic::MessageSent => "protocol.message_sent",
            SwarmTopic::MessageRetry => "protocol.message_retry",
            SwarmTopic::AckTimeout => "protocol.ack_timeout",
            SwarmTopic::AcksReceived => "protocol.acks_received",
            SwarmTopic::DeliveryFailure => "protocol.delivery_failure",
            SwarmTopic::ProtocolError => "protocol.error",
            SwarmTopic::PolicyRegistered => "reliability.policy_registered",
            SwarmTopic::RecoveryPlanRegistered => "reliability.recovery_plan_registered",
            SwarmTopic::CircuitOpen => "circuit_breaker.open",
            SwarmTopic::CircuitClose => "circuit_breaker.close",
            SwarmTopic::CircuitHalfOpen => "circuit_breaker.half_open",
        }
    }
}

impl fmt::Display for SwarmTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared bus carrying all coordination events.
pub type SwarmBus = EventBus<SwarmTopic, SwarmEvent>;

/// Payloads emitted by the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SwarmEvent {
    VotingStarted {
        voting_id: Uuid,
        topic_id: String,
        eligible_voters: usize,
    },
    VoteCast {
        voting_id: Uuid,
        agent_id: String,
        choice: String,
    },
    VotingClosed {
        voting_id: Uuid,
        result: crate::voting::MajorityResult,
    },
    TieBreakNeeded {
        voting_id: Uuid,
        tied_options: Vec<crate::voting::VotingOption>,
    },
    DecisionDeferred {
        voting_id: Uuid,
        default_option: crate::voting::VotingOption,
    },
    AgentRegistered {
        agent_id: String,
    },
    MessageSent {
        message_id: Uuid,
        from: String,
        recipients: Vec<String>,
    },
    MessageRetry {
        message_id: Uuid,
        missing: Vec<String>,
        retries: u32,
    },
    AckTimeout {
        message_id: Uuid,
        missing: Vec<String>,
    },
    AllAcksReceived {
        message_id: Uuid,
    },
    DeliveryFailure {
        message_id: Uuid,
        agent_id: String,
        reason: String,
    },
    ProtocolError {
        source_agent: String,
        detail: Value,
    },
    PolicyRegistered {
        name: String,
    },
    RecoveryPlanRegistered {
        name: String,
    },
    CircuitOpen {
        operation: String,
    },
    CircuitClosed {
        operation: String,
    },
    CircuitHalfOpen {
        operation: String,
    },
}
