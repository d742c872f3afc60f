//! Acknowledgment bookkeeping.
//!
//! Each ack-requiring message gets a pending entry recording who still owes
//! an acknowledgment. The periodic sweep redelivers to the missing
//! recipients only, and reports exactly which recipients never responded
//! once retries are exhausted.

use super::Message;
use crate::events::{SwarmBus, SwarmEvent, SwarmTopic};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// A message awaiting acknowledgments
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message: Message,
    pub expected_from: Vec<String>,
    pub received_from: Vec<String>,
    pub tracked_at: Instant,
    pub retries: u32,
}

impl PendingAck {
    fn missing(&self) -> Vec<String> {
        self.expected_from
            .iter()
            .filter(|agent| !self.received_from.contains(agent))
            .cloned()
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.expected_from
            .iter()
            .all(|agent| self.received_from.contains(agent))
    }
}

/// A redelivery instruction produced by the sweep
#[derive(Debug, Clone)]
pub struct RetryDirective {
    pub message: Message,
    pub missing: Vec<String>,
    pub retries: u32,
}

/// Tracks pending acknowledgments for the protocol
#[derive(Clone)]
pub struct AckTracker {
    pending: Arc<RwLock<HashMap<Uuid, PendingAck>>>,
    events: SwarmBus,
    max_retries: u32,
    message_timeout: Duration,
    retry_delay: Duration,
}

impl AckTracker {
    pub fn new(
        events: SwarmBus,
        max_retries: u32,
        message_timeout: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            events,
            max_retries,
            message_timeout,
            retry_delay,
        }
    }

    /// Track a single-recipient acknowledgment
    pub async fn track_acknowledgment(&self, message: Message, expected_from: String) {
        self.track(message, vec![expected_from]).await;
    }

    /// Track acknowledgments from every delivered broadcast recipient
    pub async fn track_broadcast_acknowledgment(
        &self,
        message: Message,
        expected_from: Vec<String>,
    ) {
        self.track(message, expected_from).await;
    }

    async fn track(&self, message: Message, expected_from: Vec<String>) {
        if expected_from.is_empty() {
            return;
        }
        debug!(message_id = %message.id, expected = expected_from.len(), "tracking acknowledgment");
        self.pending.write().await.insert(
            message.id,
            PendingAck {
                message,
                expected_from,
                received_from: Vec::new(),
                tracked_at: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Record one incoming acknowledgment. Removes the entry and fires the
    /// all-acks-received event once every expected recipient has responded.
    pub async fn handle_acknowledgment(&self, message_id: Uuid, from: &str) {
        let complete = {
            let mut pending = self.pending.write().await;
            let Some(entry) = pending.get_mut(&message_id) else {
                return;
            };
            if entry.expected_from.iter().any(|a| a == from)
                && !entry.received_from.iter().any(|a| a == from)
            {
                entry.received_from.push(from.to_string());
            }
            if entry.is_complete() {
                pending.remove(&message_id);
                true
            } else {
                false
            }
        };

        if complete {
            debug!(message_id = %message_id, "all acknowledgments received");
            self.events
                .publish(
                    SwarmTopic::AcksReceived,
                    SwarmEvent::AllAcksReceived { message_id },
                )
                .await;
        }
    }

    /// Scan pending entries: overdue entries with retries left yield a
    /// redelivery directive targeting the missing recipients; exhausted
    /// entries are dropped with an ack-timeout event naming them.
    pub async fn sweep(&self) -> Vec<RetryDirective> {
        let now = Instant::now();
        let mut directives = Vec::new();
        let mut timed_out = Vec::new();

        {
            let mut pending = self.pending.write().await;
            let mut exhausted = Vec::new();
            for (id, entry) in pending.iter_mut() {
                // First wait is the full message timeout; subsequent
                // retries are spaced by the configured retry delay.
                let threshold = if entry.retries == 0 {
                    self.message_timeout
                } else {
                    self.retry_delay
                };
                if now.duration_since(entry.tracked_at) <= threshold {
                    continue;
                }

                if entry.retries < self.max_retries {
                    entry.retries += 1;
                    entry.tracked_at = now;
                    directives.push(RetryDirective {
                        message: entry.message.clone(),
                        missing: entry.missing(),
                        retries: entry.retries,
                    });
                } else {
                    exhausted.push(*id);
                }
            }
            for id in exhausted {
                if let Some(entry) = pending.remove(&id) {
                    timed_out.push((id, entry.missing()));
                }
            }
        }

        for directive in &directives {
            warn!(
                message_id = %directive.message.id,
                missing = ?directive.missing,
                retries = directive.retries,
                "acknowledgment overdue, retrying missing recipients"
            );
            self.events
                .publish(
                    SwarmTopic::MessageRetry,
                    SwarmEvent::MessageRetry {
                        message_id: directive.message.id,
                        missing: directive.missing.clone(),
                        retries: directive.retries,
                    },
                )
                .await;
        }
        for (message_id, missing) in timed_out {
            warn!(message_id = %message_id, missing = ?missing, "acknowledgment retries exhausted");
            self.events
                .publish(
                    SwarmTopic::AckTimeout,
                    SwarmEvent::AckTimeout { message_id, missing },
                )
                .await;
        }

        directives
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn pending_entry(&self, message_id: Uuid) -> Option<PendingAck> {
        self.pending.read().await.get(&message_id).cloned()
    }
}
