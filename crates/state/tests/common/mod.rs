//! Shared helpers for state machine tests: a signing environment and
//! builders for the transactions the scenarios use.

use chrono::{DateTime, Duration, Utc};
use cohort_core::time::parse_rfc3339;
use cohort_core::{
    ArtifactAddPayload, ConsensusPolicy, DecisionOpenPayload, ParticipantJoinPayload,
    ParticipantType, SessionCreatePayload, StepClaimPayload, StepHandoffPayload,
    StepReleasePayload, StepResolvePayload, StepSpec, Tx, TxOp, VoteCastPayload, VoteChoice,
};
use cohort_crypto::{SignatureVerifier, TxSigner};
use cohort_state::CollabState;
use serde_json::Value;
use std::collections::BTreeSet;

pub struct TestEnv {
    pub signer: TxSigner,
    pub verifier: SignatureVerifier,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            signer: TxSigner::generate(),
            verifier: SignatureVerifier,
        }
    }

    pub fn apply(&self, state: &mut CollabState, tx: &Tx) -> cohort_state::TxOutcome {
        state.apply_tx(tx, &self.verifier)
    }

    pub fn sign(&self, tx: Tx) -> Tx {
        self.signer.sign_tx(tx).expect("signing")
    }

    pub fn signed(
        &self,
        tx_id: &str,
        session_id: &str,
        at: DateTime<Utc>,
        actor: &str,
        op: TxOp,
    ) -> Tx {
        self.sign(Tx::unsigned(
            tx_id,
            session_id,
            format!("nonce-{tx_id}"),
            at,
            actor,
            op,
        ))
    }
}

pub fn base() -> DateTime<Utc> {
    parse_rfc3339("2026-01-01T00:00:00Z").unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    base() + Duration::seconds(seconds)
}

pub fn caps(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn step_spec(step_id: &str, step_key: &str, lease_ttl: u64) -> StepSpec {
    StepSpec {
        step_id: step_id.into(),
        step_key: step_key.into(),
        name: None,
        depends_on: Vec::new(),
        required_capabilities: BTreeSet::new(),
        lease_ttl_seconds: Some(lease_ttl),
        consensus_policy: None,
    }
}

pub fn session_create(session_id: &str, name: &str, steps: Vec<StepSpec>) -> TxOp {
    TxOp::SessionCreate(SessionCreatePayload {
        session_id: session_id.into(),
        name: name.into(),
        workflow_id: None,
        context: None,
        steps,
    })
}

pub fn join(session_id: &str, participant_id: &str, reference: &str, capabilities: &[&str]) -> TxOp {
    TxOp::ParticipantJoin(ParticipantJoinPayload {
        session_id: session_id.into(),
        participant_id: participant_id.into(),
        participant_type: ParticipantType::Human,
        participant_ref: reference.into(),
        capabilities: Some(caps(capabilities)),
        trust_score: None,
    })
}

pub fn claim(step_id: &str, participant_id: &str, claim_id: &str, lease: Option<u64>) -> TxOp {
    TxOp::StepClaim(StepClaimPayload {
        step_id: step_id.into(),
        participant_id: participant_id.into(),
        claim_id: claim_id.into(),
        lease_seconds: lease,
    })
}

pub fn release(step_id: &str, participant_id: &str) -> TxOp {
    TxOp::StepRelease(StepReleasePayload {
        step_id: step_id.into(),
        participant_id: participant_id.into(),
    })
}

pub fn handoff(step_id: &str, from: &str, to: &str, new_claim_id: &str) -> TxOp {
    TxOp::StepHandoff(StepHandoffPayload {
        step_id: step_id.into(),
        from_participant_id: from.into(),
        to_participant_id: to.into(),
        new_claim_id: new_claim_id.into(),
        lease_seconds: None,
    })
}

pub fn artifact(artifact_id: &str, step_id: &str, producer_id: &str, content: Value) -> TxOp {
    TxOp::ArtifactAdd(ArtifactAddPayload {
        artifact_id: artifact_id.into(),
        step_id: step_id.into(),
        producer_id: producer_id.into(),
        kind: Some("draft".into()),
        content: Some(content),
        external_uri: None,
        content_hash: None,
        content_bytes: None,
    })
}

pub fn decision_open(decision_id: &str, step_id: &str, policy: Option<ConsensusPolicy>) -> TxOp {
    TxOp::DecisionOpen(DecisionOpenPayload {
        decision_id: decision_id.into(),
        step_id: step_id.into(),
        policy,
        deadline: None,
    })
}

pub fn vote(vote_id: &str, decision_id: &str, participant_id: &str, choice: VoteChoice) -> TxOp {
    TxOp::VoteCast(VoteCastPayload {
        vote_id: vote_id.into(),
        decision_id: decision_id.into(),
        participant_id: participant_id.into(),
        choice,
        comment: None,
    })
}

pub fn resolve(step_id: &str, participant_id: Option<&str>) -> TxOp {
    TxOp::StepResolve(StepResolvePayload {
        step_id: step_id.into(),
        participant_id: participant_id.map(Into::into),
    })
}

/// The two-step demo session from the happy-path scenario: `draft` free for
/// anyone, `review` gated on `draft` and the `review` capability.
pub fn demo_session_txs(env: &TestEnv) -> Vec<Tx> {
    let mut steps = vec![step_spec("st1", "draft", 60), {
        let mut review = step_spec("st2", "review", 60);
        review.depends_on = vec!["st1".into()];
        review.required_capabilities = caps(&["review"]);
        review
    }];
    steps[0].name = Some("draft".into());
    vec![
        env.signed(
            "tx-001",
            "s1",
            at(0),
            "user:alice",
            session_create("s1", "demo", steps),
        ),
        env.signed(
            "tx-002",
            "s1",
            at(1),
            "user:alice",
            join("s1", "pA", "user:alice", &["draft"]),
        ),
        env.signed(
            "tx-003",
            "s1",
            at(2),
            "user:bob",
            join("s1", "pB", "user:bob", &["review"]),
        ),
    ]
}
