//! Voting Engine Integration Tests
//!
//! Exercises full voting sessions end to end:
//! - majority and tie outcomes across a four-agent swarm
//! - quorum and timeout legitimacy
//! - weighted votes changing the winner
//! - event publication on the shared bus

use coordination::events::{SwarmEvent, SwarmTopic};
use coordination::voting::{Legitimacy, TieBreaker, VotingStatus};
use coordination::{
    SwarmBus, Vote, VotingConfig, VotingEngine, VotingError, VotingOption, VotingTopic,
};
use std::collections::HashSet;
use std::time::Duration;

fn four_voters() -> HashSet<String> {
    ["alpha", "beta", "gamma", "delta"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn yes_no_topic() -> VotingTopic {
    VotingTopic::new("deploy", "Ship the release candidate?").with_options(vec![
        VotingOption::new("yes", "yes"),
        VotingOption::new("no", "no"),
    ])
}

#[tokio::test]
async fn three_to_one_is_a_valid_majority() {
    let engine = VotingEngine::new(VotingConfig::default(), SwarmBus::default());
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");

    for agent in ["alpha", "beta", "gamma"] {
        engine
            .cast_vote(id, Vote::new(agent, "yes"))
            .await
            .expect("vote");
    }
    engine
        .cast_vote(id, Vote::new("delta", "no"))
        .await
        .expect("vote");

    // The fourth vote completes the session automatically
    let history = engine.voting_history().await;
    assert_eq!(history.len(), 1);
    let result = &history[0];
    assert_eq!(result.winner.id, "yes");
    assert!(result.majority_achieved);
    assert_eq!(result.legitimacy, Legitimacy::Valid);
    assert!(!result.tie_break_used);
    assert_eq!(result.participation, 1.0);
}

#[tokio::test]
async fn two_to_two_splits_need_a_tie_break() {
    let bus = SwarmBus::default();
    let mut tie_rx = bus.subscribe(SwarmTopic::TieBreakNeeded).await;
    let engine = VotingEngine::new(VotingConfig::default(), bus);
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");

    for agent in ["alpha", "beta"] {
        engine.cast_vote(id, Vote::new(agent, "yes")).await.expect("vote");
    }
    for agent in ["gamma", "delta"] {
        engine.cast_vote(id, Vote::new(agent, "no")).await.expect("vote");
    }

    let result = &engine.voting_history().await[0];
    // Even split: never a majority regardless of tie-break outcome
    assert!(!result.majority_achieved);
    assert_eq!(result.legitimacy, Legitimacy::Tied);
    assert!(result.tie_break_used);

    let envelope = tie_rx.recv().await.expect("tie break event");
    match envelope.payload {
        SwarmEvent::TieBreakNeeded { voting_id, tied_options } => {
            assert_eq!(voting_id, id);
            assert_eq!(tied_options.len(), 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn status_quo_tie_break_picks_the_first_option() {
    let config = VotingConfig {
        tie_breaker: TieBreaker::StatusQuo,
        ..Default::default()
    };
    let engine = VotingEngine::new(config, SwarmBus::default());
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");

    engine.cast_vote(id, Vote::new("alpha", "yes")).await.expect("vote");
    engine.cast_vote(id, Vote::new("beta", "no")).await.expect("vote");
    engine.cast_vote(id, Vote::new("gamma", "yes")).await.expect("vote");
    engine.cast_vote(id, Vote::new("delta", "no")).await.expect("vote");

    let result = &engine.voting_history().await[0];
    assert_eq!(result.winner.id, "yes");
    assert!(result.tie_break_used);
}

#[tokio::test]
async fn closing_early_without_quorum_is_illegitimate() {
    let engine = VotingEngine::new(VotingConfig::default(), SwarmBus::default());
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");

    engine.cast_vote(id, Vote::new("alpha", "yes")).await.expect("vote");
    let result = engine.close_voting(id).await;

    assert_eq!(result.participation, 0.25);
    assert_eq!(result.legitimacy, Legitimacy::NoQuorum);
    assert!(!result.majority_achieved);
}

#[tokio::test]
async fn deadline_expiry_closes_and_marks_timeout() {
    let bus = SwarmBus::default();
    let mut closed_rx = bus.subscribe(SwarmTopic::VotingClosed).await;
    let config = VotingConfig {
        voting_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let engine = VotingEngine::new(config, bus);
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");

    for agent in ["alpha", "beta", "gamma"] {
        engine.cast_vote(id, Vote::new(agent, "yes")).await.expect("vote");
    }

    let envelope = tokio::time::timeout(Duration::from_secs(2), closed_rx.recv())
        .await
        .expect("closes before test deadline")
        .expect("event");
    match envelope.payload {
        SwarmEvent::VotingClosed { voting_id, result } => {
            assert_eq!(voting_id, id);
            // Quorum was met before the deadline, so timeout is the verdict
            assert_eq!(result.legitimacy, Legitimacy::Timeout);
            assert_eq!(result.winner.id, "yes");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Late votes bounce off the closed session
    let late = engine.cast_vote(id, Vote::new("delta", "no")).await;
    assert!(matches!(
        late,
        Err(VotingError::NotFound(_)) | Err(VotingError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn weights_flip_a_raw_count_majority() {
    let config = VotingConfig {
        weighted_voting: true,
        ..Default::default()
    };
    let engine = VotingEngine::new(config, SwarmBus::default());
    engine.set_agent_weight("alpha", 5.0).await;

    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");
    engine.cast_vote(id, Vote::new("alpha", "no")).await.expect("vote");
    for agent in ["beta", "gamma", "delta"] {
        engine.cast_vote(id, Vote::new(agent, "yes")).await.expect("vote");
    }

    let result = &engine.voting_history().await[0];
    // 5.0 against 3.0 despite losing the raw count 1 to 3
    assert_eq!(result.winner.id, "no");
    assert_eq!(result.stats.counts["yes"], 3);
    assert!(result.stats.weighted["no"] > result.stats.weighted["yes"]);
}

#[tokio::test]
async fn votes_may_reference_option_values() {
    let engine = VotingEngine::new(VotingConfig::default(), SwarmBus::default());
    let topic = VotingTopic::new("strategy", "Pick a rollout strategy").with_options(vec![
        VotingOption::new("opt-a", "canary"),
        VotingOption::new("opt-b", "blue-green"),
    ]);
    let id = engine
        .start_voting(topic, four_voters())
        .await
        .expect("start");

    // Choice by value rather than by id
    for agent in ["alpha", "beta", "gamma"] {
        engine
            .cast_vote(id, Vote::new(agent, "canary"))
            .await
            .expect("vote");
    }
    engine
        .cast_vote(id, Vote::new("delta", "blue-green"))
        .await
        .expect("vote");

    let result = &engine.voting_history().await[0];
    assert_eq!(result.winner.id, "opt-a");
}

#[tokio::test]
async fn session_state_is_inspectable_while_open() {
    let engine = VotingEngine::new(VotingConfig::default(), SwarmBus::default());
    let id = engine
        .start_voting(yes_no_topic(), four_voters())
        .await
        .expect("start");
    engine.cast_vote(id, Vote::new("alpha", "yes")).await.expect("vote");

    let session = engine.session(id).await.expect("open session");
    assert_eq!(session.status, VotingStatus::Open);
    assert_eq!(session.votes.len(), 1);
    assert_eq!(session.eligible_voters.len(), 4);
}
