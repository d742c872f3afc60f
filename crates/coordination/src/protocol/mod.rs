//! Inter-agent messaging types.
//!
//! The protocol provides at-least-once delivery with per-agent FIFO
//! mailboxes, best-effort broadcast, and acknowledgment bookkeeping.
//! Handlers are idempotent by convention: a message may be redelivered
//! after an acknowledgment timeout but is never silently dropped before
//! retries are exhausted.

pub mod acks;
pub mod messaging;

pub use acks::{AckTracker, PendingAck};
pub use messaging::{MessagingProtocol, PROTOCOL_AGENT_ID};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// What the protocol requires of any participant: a stable identifier and
/// a notification sink for `{event, payload}` pairs.
#[async_trait]
pub trait SwarmAgent: Send + Sync {
    fn id(&self) -> &str;

    async fn notify(&self, event: &str, payload: Value) -> anyhow::Result<()>;
}

/// Application-level handler invoked for every delivered message of a type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Message categories routed to type handlers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Heartbeat,
    Acknowledgment,
    Error,
    Vote,
    Task,
    Notification,
    Custom(String),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Heartbeat => write!(f, "heartbeat"),
            MessageType::Acknowledgment => write!(f, "acknowledgment"),
            MessageType::Error => write!(f, "error"),
            MessageType::Vote => write!(f, "vote"),
            MessageType::Task => write!(f, "task"),
            MessageType::Notification => write!(f, "notification"),
            MessageType::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Delivery priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// Single or multi-recipient addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Single(String),
    Many(Vec<String>),
}

impl Recipient {
    pub fn is_empty(&self) -> bool {
        match self {
            Recipient::Single(id) => id.is_empty(),
            Recipient::Many(ids) => ids.is_empty(),
        }
    }
}

/// Optional envelope metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    /// Time-to-live in milliseconds
    pub ttl: Option<u64>,
    pub requires_ack: bool,
    pub encrypted: bool,
    pub compressed: bool,
}

/// A stamped, routable message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub to: Recipient,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub content: Value,
    pub metadata: MessageMetadata,
    pub timestamp: DateTime<Utc>,
}

/// Builder for outgoing messages; `send_message` stamps id and timestamp
#[derive(Debug, Clone)]
pub struct DraftMessage {
    pub from: String,
    pub to: Option<Recipient>,
    pub message_type: Option<MessageType>,
    pub priority: MessagePriority,
    pub content: Value,
    pub metadata: MessageMetadata,
}

impl DraftMessage {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: None,
            message_type: None,
            priority: MessagePriority::default(),
            content: Value::Null,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.to = Some(Recipient::Single(agent_id.into()));
        self
    }

    pub fn to_many(mut self, agent_ids: Vec<String>) -> Self {
        self.to = Some(Recipient::Many(agent_ids));
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn requires_ack(mut self, requires_ack: bool) -> Self {
        self.metadata.requires_ack = requires_ack;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    /// Validate and stamp into a routable message
    pub(crate) fn build(self) -> Result<Message, ProtocolError> {
        if self.from.is_empty() {
            return Err(ProtocolError::Validation("message requires a sender".into()));
        }
        let to = self
            .to
            .ok_or_else(|| ProtocolError::Validation("message requires a recipient".into()))?;
        if to.is_empty() {
            return Err(ProtocolError::Validation(
                "message recipient list is empty".into(),
            ));
        }
        let message_type = self
            .message_type
            .ok_or_else(|| ProtocolError::Validation("message requires a type".into()))?;

        Ok(Message {
            id: Uuid::new_v4(),
            from: self.from,
            to,
            message_type,
            priority: self.priority,
            content: self.content,
            metadata: self.metadata,
            timestamp: Utc::now(),
        })
    }
}

/// Channel addressing modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Direct,
    Broadcast,
    Multicast,
}

/// A named participant set messages can be expanded against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationChannel {
    pub id: Uuid,
    pub channel_type: ChannelType,
    pub participants: HashSet<String>,
    pub established: DateTime<Utc>,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// Configuration for the messaging protocol
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Redelivery attempts before an acknowledgment is abandoned
    pub max_retries: u32,

    /// Spacing between redelivery attempts after the first timeout
    pub retry_delay: Duration,

    /// How long to wait for acknowledgments before the first retry
    pub message_timeout: Duration,

    /// Mailbox capacity per agent
    pub max_queue_size: usize,

    /// Pass-through encryption stage toggle
    pub enable_encryption: bool,

    /// Pass-through compression stage toggle
    pub enable_compression: bool,

    /// Compression applies only above this serialized size in bytes
    pub compression_threshold: usize,

    /// Mailbox drain cadence
    pub delivery_interval: Duration,

    /// Pending-acknowledgment sweep cadence
    pub ack_sweep_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            message_timeout: Duration::from_millis(30_000),
            max_queue_size: 1000,
            enable_encryption: false,
            enable_compression: true,
            compression_threshold: 1024,
            delivery_interval: Duration::from_millis(100),
            ack_sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Protocol statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolStatistics {
    pub registered_agents: usize,
    pub total_channels: usize,
    /// Channels with activity within the last 300 seconds
    pub active_channels: usize,
    pub queued_messages: usize,
    pub pending_acknowledgments: usize,
}

/// Messaging protocol errors. These are synchronous and never retried
/// automatically so backpressure signals stay visible to callers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message validation failed: {0}")]
    Validation(String),

    #[error("Agent {0} is not registered")]
    AgentNotFound(String),

    #[error("Mailbox for agent {agent} is full (capacity {capacity})")]
    QueueFull { agent: String, capacity: usize },

    #[error("Channel {0} not found")]
    ChannelNotFound(Uuid),
}
