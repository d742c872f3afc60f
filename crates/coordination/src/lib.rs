//! Swarm coordination core.
//!
//! Three cooperating subsystems for multi-agent swarms:
//!
//! - [`voting`] — majority decisions over proposed options, with quorum,
//!   weighted votes, deadlines and configurable tie-breaking
//! - [`protocol`] — reliable inter-agent messaging: per-agent mailboxes,
//!   channels, acknowledgment tracking and timed redelivery
//! - [`reliability`] — typed retries, circuit breaking and declarative
//!   recovery plans around fallible operations
//!
//! All subsystems report state transitions on a shared [`events::SwarmBus`].

pub mod events;
pub mod protocol;
pub mod reliability;
pub mod voting;

pub use events::{SwarmBus, SwarmEvent, SwarmTopic};
pub use protocol::{
    DraftMessage, Message, MessageHandler, MessagePriority, MessageType, MessagingProtocol,
    ProtocolConfig, ProtocolError, SwarmAgent, PROTOCOL_AGENT_ID,
};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, ErrorType, RecoveryManager,
    RecoveryPlan, RetryExecutor, RetryPolicy, WorkflowError,
};
pub use voting::{
    MajorityResult, TieBreaker, Vote, VotingConfig, VotingEngine, VotingError, VotingOption,
    VotingTopic,
};
