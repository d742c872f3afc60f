//! Voting session state machine.
//!
//! Sessions live in an engine-owned map; they transition to closed exactly
//! once, either when the eligible set has fully voted or when the voting
//! timeout fires. Closing an unknown session degrades to a safe fallback
//! result so racing callers are never left without an outcome.

use super::{
    ActiveVoting, Legitimacy, MajorityResult, TieBreaker, Vote, VotingConfig, VotingError,
    VotingOption, VotingStats, VotingStatus, VotingTopic,
};
use crate::events::{SwarmBus, SwarmEvent, SwarmTopic};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Every eligible voter has cast a vote
    Completed,
    /// The voting timeout fired
    Timeout,
    /// An external caller closed the session
    External,
}

/// Tie-break side effects to report after the tally
enum TieEffect {
    None,
    BreakNeeded(Vec<VotingOption>),
    Deferred(VotingOption),
}

/// Majority/consensus voting engine
#[derive(Clone)]
pub struct VotingEngine {
    config: VotingConfig,
    sessions: Arc<RwLock<HashMap<Uuid, ActiveVoting>>>,
    agent_weights: Arc<RwLock<HashMap<String, f64>>>,
    history: Arc<RwLock<VecDeque<MajorityResult>>>,
    timeouts: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    events: SwarmBus,
}

impl VotingEngine {
    pub fn new(config: VotingConfig, events: SwarmBus) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            agent_weights: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            timeouts: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Register a standing weight for an agent, used when weighted voting
    /// is enabled and a vote carries no explicit weight
    pub async fn set_agent_weight(&self, agent_id: impl Into<String>, weight: f64) {
        self.agent_weights.write().await.insert(agent_id.into(), weight);
    }

    /// Open a new voting session and schedule its automatic close
    pub async fn start_voting(
        &self,
        topic: VotingTopic,
        eligible_voters: HashSet<String>,
    ) -> Result<Uuid, VotingError> {
        if eligible_voters.is_empty() {
            return Err(VotingError::EmptyVoters);
        }

        let voting_id = Uuid::new_v4();
        let session = ActiveVoting {
            id: voting_id,
            topic: topic.clone(),
            eligible_voters: eligible_voters.clone(),
            votes: HashMap::new(),
            start_time: Utc::now(),
            status: VotingStatus::Open,
        };

        self.sessions.write().await.insert(voting_id, session);

        let engine = self.clone();
        let timeout = self.config.voting_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = engine.close_internal(voting_id, CloseReason::Timeout).await;
        });
        self.timeouts.lock().insert(voting_id, handle);

        info!(
            voting_id = %voting_id,
            topic_id = %topic.id,
            eligible = eligible_voters.len(),
            "voting session started"
        );
        self.events
            .publish(
                SwarmTopic::VotingStarted,
                SwarmEvent::VotingStarted {
                    voting_id,
                    topic_id: topic.id,
                    eligible_voters: eligible_voters.len(),
                },
            )
            .await;

        Ok(voting_id)
    }

    /// Record a vote. Completing the eligible set closes the session
    /// immediately without waiting for the timeout.
    pub async fn cast_vote(&self, voting_id: Uuid, vote: Vote) -> Result<(), VotingError> {
        let complete = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&voting_id)
                .ok_or(VotingError::NotFound(voting_id))?;

            if session.status != VotingStatus::Open {
                return Err(VotingError::InvalidState {
                    id: voting_id,
                    status: session.status,
                });
            }
            if !session.eligible_voters.contains(&vote.agent_id) {
                return Err(VotingError::NotEligible(vote.agent_id));
            }
            if session.votes.contains_key(&vote.agent_id) {
                return Err(VotingError::DuplicateVote(vote.agent_id));
            }
            if session.topic.resolve_option(&vote.choice).is_none() {
                return Err(VotingError::InvalidOption(vote.choice));
            }

            session.votes.insert(vote.agent_id.clone(), vote.clone());
            session.votes.len() == session.eligible_voters.len()
        };

        debug!(voting_id = %voting_id, agent_id = %vote.agent_id, choice = %vote.choice, "vote cast");
        self.events
            .publish(
                SwarmTopic::VoteCast,
                SwarmEvent::VoteCast {
                    voting_id,
                    agent_id: vote.agent_id,
                    choice: vote.choice,
                },
            )
            .await;

        if complete {
            self.close_internal(voting_id, CloseReason::Completed).await;
        }

        Ok(())
    }

    /// Close a session and compute its result. Idempotent: an unknown id
    /// yields the fallback result instead of an error.
    pub async fn close_voting(&self, voting_id: Uuid) -> MajorityResult {
        self.close_internal(voting_id, CloseReason::External).await
    }

    /// Snapshot of a session, if still open
    pub async fn session(&self, voting_id: Uuid) -> Option<ActiveVoting> {
        self.sessions.read().await.get(&voting_id).cloned()
    }

    /// Closed-session results, oldest first
    pub async fn voting_history(&self) -> Vec<MajorityResult> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn close_internal(&self, voting_id: Uuid, reason: CloseReason) -> MajorityResult {
        // Cancel the pending timeout; the timeout task itself is already
        // past its sleep, so it must not be aborted mid-close.
        if let Some(handle) = self.timeouts.lock().remove(&voting_id) {
            if reason != CloseReason::Timeout {
                handle.abort();
            }
        }

        let session = self.sessions.write().await.remove(&voting_id);
        let Some(mut session) = session else {
            warn!(voting_id = %voting_id, "closing unknown voting session, using fallback result");
            return Self::fallback_result(voting_id);
        };

        session.status = match reason {
            CloseReason::Timeout => VotingStatus::Timeout,
            _ => VotingStatus::Closed,
        };

        let weights = self.agent_weights.read().await.clone();
        let (result, effect) = self.compute_result(&session, reason, &weights);

        match effect {
            TieEffect::None => {}
            TieEffect::BreakNeeded(tied_options) => {
                self.events
                    .publish(
                        SwarmTopic::TieBreakNeeded,
                        SwarmEvent::TieBreakNeeded {
                            voting_id,
                            tied_options,
                        },
                    )
                    .await;
            }
            TieEffect::Deferred(default_option) => {
                self.events
                    .publish(
                        SwarmTopic::DecisionDeferred,
                        SwarmEvent::DecisionDeferred {
                            voting_id,
                            default_option,
                        },
                    )
                    .await;
            }
        }

        info!(
            voting_id = %voting_id,
            winner = %result.winner.value,
            legitimacy = %result.legitimacy,
            participation = result.participation,
            "voting session closed"
        );

        {
            let mut history = self.history.write().await;
            history.push_back(result.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        self.events
            .publish(
                SwarmTopic::VotingClosed,
                SwarmEvent::VotingClosed {
                    voting_id,
                    result: result.clone(),
                },
            )
            .await;

        result
    }

    fn compute_result(
        &self,
        session: &ActiveVoting,
        reason: CloseReason,
        agent_weights: &HashMap<String, f64>,
    ) -> (MajorityResult, TieEffect) {
        let actual = session.votes.len();
        let eligible = session.eligible_voters.len();
        let participation = actual as f64 / eligible as f64;
        let quorum_met = participation >= self.config.quorum_required;

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut weighted: HashMap<String, f64> = HashMap::new();
        for vote in session.votes.values() {
            let Some(option) = session.topic.resolve_option(&vote.choice) else {
                continue;
            };
            *counts.entry(option.id.clone()).or_insert(0) += 1;
            let weight = if self.config.weighted_voting {
                vote.weight
                    .or_else(|| agent_weights.get(&vote.agent_id).copied())
                    .unwrap_or(1.0)
            } else {
                1.0
            };
            *weighted.entry(option.id.clone()).or_insert(0.0) += weight;
        }
        let total_weight: f64 = weighted.values().sum();

        let mut percentages: HashMap<String, f64> = HashMap::new();
        for option in &session.topic.options {
            let share = if total_weight > 0.0 {
                weighted.get(&option.id).copied().unwrap_or(0.0) / total_weight
            } else {
                0.0
            };
            percentages.insert(option.id.clone(), share);
        }

        let stats = VotingStats {
            counts,
            weighted: weighted.clone(),
            percentages: percentages.clone(),
            total_votes: actual,
            total_weight,
        };

        let top_weight = weighted.values().cloned().fold(0.0_f64, f64::max);
        let tied: Vec<VotingOption> = session
            .topic
            .options
            .iter()
            .filter(|o| {
                let w = weighted.get(&o.id).copied().unwrap_or(0.0);
                top_weight > 0.0 && (w - top_weight).abs() < 1e-9
            })
            .cloned()
            .collect();

        let mut tie_break_used = false;
        let mut effect = TieEffect::None;
        let winner = match tied.len() {
            0 => Self::neutral_option(),
            1 => tied[0].clone(),
            _ => {
                tie_break_used = true;
                match self.config.tie_breaker {
                    TieBreaker::Queen => {
                        effect = TieEffect::BreakNeeded(tied.clone());
                        tied[0].clone()
                    }
                    TieBreaker::Random => {
                        let pick = rand::thread_rng().gen_range(0..tied.len());
                        tied[pick].clone()
                    }
                    TieBreaker::StatusQuo => tied[0].clone(),
                    TieBreaker::Defer => {
                        effect = TieEffect::Deferred(tied[0].clone());
                        tied[0].clone()
                    }
                }
            }
        };

        let winner_share = percentages.get(&winner.id).copied().unwrap_or(0.0);
        let majority_achieved = winner_share > self.config.voting_threshold;

        let legitimacy = if !quorum_met {
            Legitimacy::NoQuorum
        } else if reason == CloseReason::Timeout {
            Legitimacy::Timeout
        } else if tie_break_used {
            Legitimacy::Tied
        } else {
            Legitimacy::Valid
        };

        let result = MajorityResult {
            topic_id: session.topic.id.clone(),
            winner,
            stats,
            participation,
            majority_achieved,
            legitimacy,
            tie_break_used,
            timestamp: Utc::now(),
        };
        (result, effect)
    }

    /// Neutral default returned when a session cannot be resolved
    fn neutral_option() -> VotingOption {
        VotingOption {
            id: "proceed".to_string(),
            value: "proceed".to_string(),
            description: "Proceed with the default action".to_string(),
            proposed_by: None,
        }
    }

    fn fallback_result(voting_id: Uuid) -> MajorityResult {
        MajorityResult {
            topic_id: voting_id.to_string(),
            winner: Self::neutral_option(),
            stats: VotingStats::default(),
            participation: 0.0,
            majority_achieved: false,
            legitimacy: Legitimacy::NoQuorum,
            tie_break_used: false,
            timestamp: Utc::now(),
        }
    }
}
