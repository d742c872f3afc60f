//! Messaging protocol engine.
//!
//! Owns per-agent mailboxes, channels, and acknowledgment state. A
//! fixed-period delivery loop drains every mailbox in FIFO order; a
//! companion sweep redelivers messages whose acknowledgments are overdue.
//! Both tasks are cancelled on shutdown.

use super::acks::{AckTracker, RetryDirective};
use super::{
    ChannelType, CommunicationChannel, DraftMessage, Message, MessageHandler, MessageType,
    ProtocolConfig, ProtocolError, ProtocolStatistics, Recipient, SwarmAgent,
};
use crate::events::{SwarmBus, SwarmEvent, SwarmTopic};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id used for protocol-originated messages (retries, error reports)
pub const PROTOCOL_AGENT_ID: &str = "protocol";

/// Channels with activity within this window count as active
const CHANNEL_ACTIVE_WINDOW_SECS: i64 = 300;

struct AgentEntry {
    agent: Arc<dyn SwarmAgent>,
    mailbox: VecDeque<Message>,
}

/// Reliable inter-agent messaging with mailboxes, channels and acks
#[derive(Clone)]
pub struct MessagingProtocol {
    config: ProtocolConfig,
    agents: Arc<RwLock<HashMap<String, AgentEntry>>>,
    channels: Arc<RwLock<HashMap<Uuid, CommunicationChannel>>>,
    acks: AckTracker,
    handlers: Arc<parking_lot::RwLock<HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>>>,
    events: SwarmBus,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MessagingProtocol {
    pub fn new(config: ProtocolConfig, events: SwarmBus) -> Self {
        let acks = AckTracker::new(
            events.clone(),
            config.max_retries,
            config.message_timeout,
            config.retry_delay,
        );
        let protocol = Self {
            config,
            agents: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            acks,
            handlers: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            events: events.clone(),
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        // Baseline liveness works without any application handlers
        protocol.register_handler(MessageType::Heartbeat, Arc::new(HeartbeatHandler));
        protocol.register_handler(
            MessageType::Error,
            Arc::new(ErrorEventHandler { events }),
        );
        protocol
    }

    /// Spawn the delivery loop and acknowledgment sweep
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let protocol = self.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(protocol.config.delivery_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => protocol.deliver_tick().await,
                }
            }
        }));

        let protocol = self.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(protocol.config.ack_sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => protocol.ack_sweep_tick().await,
                }
            }
        }));

        info!("messaging protocol started");
    }

    /// Cancel the delivery loop and acknowledgment sweep
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("messaging protocol stopped");
    }

    /// Allocate a mailbox for an agent and start delivering to it
    pub async fn register_agent(&self, agent: Arc<dyn SwarmAgent>) {
        let agent_id = agent.id().to_string();
        self.agents.write().await.insert(
            agent_id.clone(),
            AgentEntry {
                agent,
                mailbox: VecDeque::new(),
            },
        );
        info!(agent_id = %agent_id, "agent registered");
        self.events
            .publish(
                SwarmTopic::AgentRegistered,
                SwarmEvent::AgentRegistered { agent_id },
            )
            .await;
    }

    /// Register an application handler for a message type. Handlers run in
    /// registration order on every delivered message of that type.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    /// Validate, stamp and route a message. Returns its id.
    pub async fn send_message(&self, draft: DraftMessage) -> Result<Uuid, ProtocolError> {
        let mut message = draft.build()?;
        self.apply_outbound_stages(&mut message);

        let delivered = match message.to.clone() {
            Recipient::Single(to) => {
                self.enqueue_direct(&to, message.clone()).await?;
                if message.metadata.requires_ack {
                    self.acks
                        .track_acknowledgment(message.clone(), to.clone())
                        .await;
                }
                vec![to]
            }
            Recipient::Many(targets) => {
                let delivered = self.enqueue_broadcast(&targets, &message).await;
                if message.metadata.requires_ack && !delivered.is_empty() {
                    self.acks
                        .track_broadcast_acknowledgment(message.clone(), delivered.clone())
                        .await;
                }
                delivered
            }
        };

        debug!(
            message_id = %message.id,
            from = %message.from,
            recipients = delivered.len(),
            "message enqueued"
        );
        self.events
            .publish(
                SwarmTopic::MessageSent,
                SwarmEvent::MessageSent {
                    message_id: message.id,
                    from: message.from.clone(),
                    recipients: delivered,
                },
            )
            .await;

        Ok(message.id)
    }

    /// Create a channel over the given participant set
    pub async fn create_channel(
        &self,
        participants: Vec<String>,
        channel_type: ChannelType,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let channel = CommunicationChannel {
            id,
            channel_type,
            participants: participants.into_iter().collect::<HashSet<_>>(),
            established: now,
            message_count: 0,
            last_activity: now,
        };
        self.channels.write().await.insert(id, channel);
        debug!(channel_id = %id, "channel created");
        id
    }

    /// Send through a channel, expanding recipients from its current
    /// participant set (minus the sender)
    pub async fn send_to_channel(
        &self,
        channel_id: Uuid,
        draft: DraftMessage,
    ) -> Result<Uuid, ProtocolError> {
        let recipients = {
            let mut channels = self.channels.write().await;
            let channel = channels
                .get_mut(&channel_id)
                .ok_or(ProtocolError::ChannelNotFound(channel_id))?;
            channel.message_count += 1;
            channel.last_activity = Utc::now();
            channel
                .participants
                .iter()
                .filter(|p| **p != draft.from)
                .cloned()
                .collect::<Vec<_>>()
        };

        self.send_message(draft.to_many(recipients)).await
    }

    pub async fn channel(&self, channel_id: Uuid) -> Option<CommunicationChannel> {
        self.channels.read().await.get(&channel_id).cloned()
    }

    pub async fn statistics(&self) -> ProtocolStatistics {
        let (registered_agents, queued_messages) = {
            let agents = self.agents.read().await;
            let queued: usize = agents.values().map(|e| e.mailbox.len()).sum();
            (agents.len(), queued)
        };
        let (total_channels, active_channels) = {
            let channels = self.channels.read().await;
            let cutoff = Utc::now() - chrono::Duration::seconds(CHANNEL_ACTIVE_WINDOW_SECS);
            let active = channels
                .values()
                .filter(|c| c.last_activity >= cutoff)
                .count();
            (channels.len(), active)
        };

        ProtocolStatistics {
            registered_agents,
            total_channels,
            active_channels,
            queued_messages,
            pending_acknowledgments: self.acks.pending_count().await,
        }
    }

    pub fn ack_tracker(&self) -> &AckTracker {
        &self.acks
    }

    /// Drain every mailbox in FIFO order and deliver
    pub(crate) async fn deliver_tick(&self) {
        let batches: Vec<(String, Arc<dyn SwarmAgent>, Vec<Message>)> = {
            let mut agents = self.agents.write().await;
            agents
                .iter_mut()
                .filter(|(_, entry)| !entry.mailbox.is_empty())
                .map(|(id, entry)| {
                    (
                        id.clone(),
                        entry.agent.clone(),
                        entry.mailbox.drain(..).collect(),
                    )
                })
                .collect()
        };

        for (agent_id, agent, messages) in batches {
            for message in messages {
                self.process_delivery(&agent_id, agent.clone(), message).await;
            }
        }
    }

    pub(crate) async fn ack_sweep_tick(&self) {
        let directives = self.acks.sweep().await;
        for directive in directives {
            self.redeliver(directive).await;
        }
    }

    async fn process_delivery(
        &self,
        agent_id: &str,
        agent: Arc<dyn SwarmAgent>,
        mut message: Message,
    ) {
        self.restore_inbound_stages(&mut message);

        // Acknowledgment responses feed straight back into ack bookkeeping
        if message.message_type == MessageType::Acknowledgment {
            if let Some(correlation_id) = message.metadata.correlation_id {
                self.acks
                    .handle_acknowledgment(correlation_id, &message.from)
                    .await;
            }
        }

        let handlers = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();

        let mut failure: Option<String> = None;
        for handler in handlers {
            if let Err(err) = handler.handle(&message).await {
                failure = Some(err.to_string());
                break;
            }
        }

        if failure.is_none() {
            let payload = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);
            if let Err(err) = agent.notify("message", payload).await {
                failure = Some(err.to_string());
            }
        }

        match failure {
            None => {
                // Heartbeats are acknowledged even when not requested
                let needs_ack = message.metadata.requires_ack
                    || message.message_type == MessageType::Heartbeat;
                if needs_ack && message.message_type != MessageType::Acknowledgment {
                    self.send_acknowledgment(agent_id, &message).await;
                }
            }
            Some(reason) => {
                warn!(
                    message_id = %message.id,
                    agent_id = %agent_id,
                    reason = %reason,
                    "message delivery failed"
                );
                self.events
                    .publish(
                        SwarmTopic::DeliveryFailure,
                        SwarmEvent::DeliveryFailure {
                            message_id: message.id,
                            agent_id: agent_id.to_string(),
                            reason: reason.clone(),
                        },
                    )
                    .await;

                if message.from != PROTOCOL_AGENT_ID {
                    let report = DraftMessage::new(PROTOCOL_AGENT_ID)
                        .to_agent(message.from.clone())
                        .message_type(MessageType::Error)
                        .content(json!({
                            "failed_message": message.id,
                            "recipient": agent_id,
                            "reason": reason,
                        }))
                        .correlation_id(message.id);
                    if let Err(err) = self.send_message(report).await {
                        debug!(error = %err, "failure report could not be sent");
                    }
                }
            }
        }
    }

    async fn send_acknowledgment(&self, from_agent: &str, message: &Message) {
        let ack = DraftMessage::new(from_agent)
            .to_agent(message.from.clone())
            .message_type(MessageType::Acknowledgment)
            .content(json!({ "acknowledged": message.id }))
            .correlation_id(message.id);

        match ack.build() {
            Ok(ack_message) => {
                // The sender may have no mailbox (external caller); apply
                // the acknowledgment directly in that case
                if self
                    .enqueue_direct(&message.from, ack_message)
                    .await
                    .is_err()
                {
                    self.acks.handle_acknowledgment(message.id, from_agent).await;
                }
            }
            Err(err) => debug!(error = %err, "acknowledgment could not be built"),
        }
    }

    async fn redeliver(&self, directive: RetryDirective) {
        for agent_id in &directive.missing {
            if let Err(err) = self
                .enqueue_direct(agent_id, directive.message.clone())
                .await
            {
                debug!(agent_id = %agent_id, error = %err, "redelivery skipped");
            }
        }
    }

    async fn enqueue_direct(&self, to: &str, message: Message) -> Result<(), ProtocolError> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(to)
            .ok_or_else(|| ProtocolError::AgentNotFound(to.to_string()))?;
        if entry.mailbox.len() >= self.config.max_queue_size {
            return Err(ProtocolError::QueueFull {
                agent: to.to_string(),
                capacity: self.config.max_queue_size,
            });
        }
        entry.mailbox.push_back(message);
        Ok(())
    }

    /// Best-effort fan-out: recipients without a mailbox or without
    /// capacity are silently skipped
    async fn enqueue_broadcast(&self, targets: &[String], message: &Message) -> Vec<String> {
        let mut agents = self.agents.write().await;
        let mut delivered = Vec::new();
        for target in targets {
            let Some(entry) = agents.get_mut(target) else {
                continue;
            };
            if entry.mailbox.len() >= self.config.max_queue_size {
                continue;
            }
            entry.mailbox.push_back(message.clone());
            delivered.push(target.clone());
        }
        delivered
    }

    /// Encryption then compression. Both stages are pass-through extension
    /// points: only the metadata flags change, content is untouched.
    fn apply_outbound_stages(&self, message: &mut Message) {
        if self.config.enable_encryption {
            message.metadata.encrypted = true;
        }
        if self.config.enable_compression {
            let serialized_len = message.content.to_string().len();
            if serialized_len > self.config.compression_threshold {
                message.metadata.compressed = true;
            }
        }
    }

    /// Reverse of the outbound stages, applied before handler invocation
    fn restore_inbound_stages(&self, message: &mut Message) {
        message.metadata.compressed = false;
        message.metadata.encrypted = false;
    }
}

/// Default heartbeat handler; acknowledgment is issued by the delivery loop
struct HeartbeatHandler;

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        debug!(from = %message.from, "heartbeat received");
        Ok(())
    }
}

/// Default error handler: re-emit inbound error messages on the event bus
struct ErrorEventHandler {
    events: SwarmBus,
}

#[async_trait]
impl MessageHandler for ErrorEventHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.events
            .publish(
                SwarmTopic::ProtocolError,
                SwarmEvent::ProtocolError {
                    source_agent: message.from.clone(),
                    detail: message.content.clone(),
                },
            )
            .await;
        Ok(())
    }
}
