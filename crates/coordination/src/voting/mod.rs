//! Voting and consensus types for the swarm.
//!
//! The [`VotingEngine`] owns all active sessions; callers interact only
//! through its public operations. Results are appended to a bounded
//! in-memory history and handed to external collaborators via events.

pub mod engine;

pub use engine::VotingEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Tie-break strategies for options sharing the highest vote share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreaker {
    /// Delegate to an external override (a tie-break-needed event is
    /// emitted); the first tied option is returned as the default
    Queen,
    /// Uniformly pick among the tied options
    Random,
    /// Deterministically keep the first tied option
    StatusQuo,
    /// Keep the first tied option and emit a decision-deferred event
    Defer,
}

impl fmt::Display for TieBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TieBreaker::Queen => write!(f, "queen"),
            TieBreaker::Random => write!(f, "random"),
            TieBreaker::StatusQuo => write!(f, "status-quo"),
            TieBreaker::Defer => write!(f, "defer"),
        }
    }
}

/// Configuration for the voting engine
#[derive(Debug, Clone)]
pub struct VotingConfig {
    /// Winning percentage must strictly exceed this for a majority
    pub voting_threshold: f64,

    /// Minimum participation fraction for a legitimate result
    pub quorum_required: f64,

    /// Strategy applied when two or more options tie at the top
    pub tie_breaker: TieBreaker,

    /// Sessions auto-close this long after starting
    pub voting_timeout: Duration,

    /// Use per-vote / per-agent weights instead of raw counts
    pub weighted_voting: bool,

    /// Maximum number of results retained in history
    pub history_limit: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            voting_threshold: 0.5,
            quorum_required: 0.5,
            tie_breaker: TieBreaker::Queen,
            voting_timeout: Duration::from_millis(30_000),
            weighted_voting: false,
            history_limit: 100,
        }
    }
}

/// A single cast vote. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    /// Option id or option value the agent voted for
    pub choice: String,
    pub weight: Option<f64>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    pub fn new(agent_id: impl Into<String>, choice: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            choice: choice.into(),
            weight: None,
            confidence: None,
            reasoning: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// One selectable option on a voting topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingOption {
    pub id: String,
    pub value: String,
    pub description: String,
    pub proposed_by: Option<String>,
}

impl VotingOption {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            id: id.into(),
            description: value.clone(),
            value,
            proposed_by: None,
        }
    }
}

/// The question being voted on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingTopic {
    pub id: String,
    pub topic_type: String,
    pub question: String,
    pub options: Vec<VotingOption>,
    pub context: Value,
    pub deadline: Option<DateTime<Utc>>,
}

impl VotingTopic {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic_type: "decision".to_string(),
            question: question.into(),
            options: Vec::new(),
            context: Value::Null,
            deadline: None,
        }
    }

    pub fn with_options(mut self, options: Vec<VotingOption>) -> Self {
        self.options = options;
        self
    }

    /// Resolve a vote choice against the topic's options, by id or by value
    pub fn resolve_option(&self, choice: &str) -> Option<&VotingOption> {
        self.options
            .iter()
            .find(|o| o.id == choice || o.value == choice)
    }
}

/// Lifecycle state of a voting session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingStatus {
    Open,
    Closed,
    Timeout,
}

impl fmt::Display for VotingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VotingStatus::Open => write!(f, "open"),
            VotingStatus::Closed => write!(f, "closed"),
            VotingStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Mutable state of a session, owned exclusively by the engine while open
#[derive(Debug, Clone)]
pub struct ActiveVoting {
    pub id: Uuid,
    pub topic: VotingTopic,
    pub eligible_voters: HashSet<String>,
    pub votes: HashMap<String, Vote>,
    pub start_time: DateTime<Utc>,
    pub status: VotingStatus,
}

/// Legitimacy classification of a closed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Legitimacy {
    Valid,
    NoQuorum,
    Tied,
    Timeout,
}

impl fmt::Display for Legitimacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Legitimacy::Valid => write!(f, "valid"),
            Legitimacy::NoQuorum => write!(f, "no-quorum"),
            Legitimacy::Tied => write!(f, "tied"),
            Legitimacy::Timeout => write!(f, "timeout"),
        }
    }
}

/// Per-option tallies for a closed session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VotingStats {
    /// Raw vote counts keyed by option id
    pub counts: HashMap<String, usize>,
    /// Weighted totals keyed by option id (equal to counts when unweighted)
    pub weighted: HashMap<String, f64>,
    /// Share of the weighted total keyed by option id
    pub percentages: HashMap<String, f64>,
    pub total_votes: usize,
    pub total_weight: f64,
}

/// Immutable outcome of a voting session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MajorityResult {
    pub topic_id: String,
    pub winner: VotingOption,
    pub stats: VotingStats,
    /// Fraction of eligible voters that participated
    pub participation: f64,
    pub majority_achieved: bool,
    pub legitimacy: Legitimacy,
    pub tie_break_used: bool,
    pub timestamp: DateTime<Utc>,
}

/// Voting engine errors
#[derive(Debug, Error)]
pub enum VotingError {
    #[error("Voting requires at least one eligible voter")]
    EmptyVoters,

    #[error("Voting session {0} not found")]
    NotFound(Uuid),

    #[error("Voting session {id} is not open (status: {status})")]
    InvalidState { id: Uuid, status: VotingStatus },

    #[error("Agent {0} is not eligible to vote in this session")]
    NotEligible(String),

    #[error("Agent {0} has already voted in this session")]
    DuplicateVote(String),

    #[error("Choice {0:?} does not match any option of the topic")]
    InvalidOption(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_option_by_id_and_value() {
        let topic = VotingTopic::new("t1", "Ship it?").with_options(vec![
            VotingOption::new("opt-yes", "yes"),
            VotingOption::new("opt-no", "no"),
        ]);

        assert_eq!(
            topic.resolve_option("opt-yes").map(|o| o.value.as_str()),
            Some("yes")
        );
        assert_eq!(
            topic.resolve_option("no").map(|o| o.id.as_str()),
            Some("opt-no")
        );
        assert!(topic.resolve_option("maybe").is_none());
    }

    #[test]
    fn vote_builder_sets_fields() {
        let vote = Vote::new("agent-1", "yes")
            .with_weight(2.0)
            .with_reasoning("strong signal");
        assert_eq!(vote.agent_id, "agent-1");
        assert_eq!(vote.weight, Some(2.0));
        assert!(vote.reasoning.is_some());
    }

    #[test]
    fn display_formats() {
        assert_eq!(TieBreaker::StatusQuo.to_string(), "status-quo");
        assert_eq!(Legitimacy::NoQuorum.to_string(), "no-quorum");
        assert_eq!(VotingStatus::Timeout.to_string(), "timeout");
    }
}
