//! Per-operation validation paths: every precondition in the protocol table
//! has a rejection here, and rejections never leave partial mutations.

mod common;

use cohort_core::time::parse_rfc3339;
use cohort_core::{
    ArtifactAddPayload, DecisionOpenPayload, ParticipantJoinPayload, ParticipantType,
    ReceiptStatus, SessionStatus, StepStatus, Tx, TxOp, VoteChoice,
};
use cohort_state::CollabState;
use common::*;
use serde_json::json;

fn expect_code(outcome: &cohort_state::TxOutcome, code: &str) {
    assert_eq!(outcome.receipt.status, ReceiptStatus::Rejected);
    let err = outcome.receipt.error.as_ref().expect("rejection error");
    assert_eq!(err.code, code, "message: {}", err.message);
}

fn seeded(env: &TestEnv) -> CollabState {
    let mut state = CollabState::new();
    for tx in demo_session_txs(env) {
        assert_eq!(
            env.apply(&mut state, &tx).receipt.status,
            ReceiptStatus::Applied
        );
    }
    state
}

#[test]
fn unsigned_tx_is_rejected_with_bad_signature() {
    let env = TestEnv::new();
    let mut state = CollabState::new();
    let tx = Tx::unsigned(
        "tx-x",
        "s1",
        "n",
        base(),
        "user:alice",
        session_create("s1", "demo", vec![]),
    );
    let outcome = env.apply(&mut state, &tx);
    expect_code(&outcome, "BAD_SIGNATURE");
    assert!(state.session("s1").is_none());
}

#[test]
fn resigned_by_other_key_fails_verification() {
    let env = TestEnv::new();
    let other = TestEnv::new();
    let mut state = CollabState::new();
    let mut tx = env.signed(
        "tx-x",
        "s1",
        base(),
        "user:alice",
        session_create("s1", "demo", vec![]),
    );
    // Swap in a foreign public key without re-signing.
    tx.public_key = other.signer.public_key_b64().to_string();
    let outcome = env.apply(&mut state, &tx);
    expect_code(&outcome, "BAD_SIGNATURE");
}

#[test]
fn session_create_rejects_duplicates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-dup",
            "s1",
            at(10),
            "user:alice",
            session_create("s1", "again", vec![]),
        ),
    );
    expect_code(&outcome, "CONFLICT");

    // Duplicate step key inside the payload.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-dup2",
            "s2",
            at(11),
            "user:alice",
            session_create(
                "s2",
                "bad",
                vec![step_spec("n1", "same", 60), step_spec("n2", "same", 60)],
            ),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
    assert!(state.session("s2").is_none());
    assert!(state.step("n1").is_none(), "no partial mutation");

    // Step id already taken by another session.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-dup3",
            "s3",
            at(12),
            "user:alice",
            session_create("s3", "bad", vec![step_spec("st1", "fresh", 60)]),
        ),
    );
    expect_code(&outcome, "CONFLICT");
}

#[test]
fn join_requires_existing_active_session() {
    let env = TestEnv::new();
    let mut state = CollabState::new();
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-j1",
            "missing",
            at(0),
            "user:alice",
            join("missing", "pX", "user:x", &[]),
        ),
    );
    expect_code(&outcome, "NOT_FOUND");
}

#[test]
fn rejoin_with_same_ref_is_a_touch() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    // Same ref, different case, different proposed id: the original
    // participant is touched instead of a duplicate being created.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-r1",
            "s1",
            at(30),
            "user:alice",
            join("s1", "pA-new", "User:Alice", &["draft", "review"]),
        ),
    );
    assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);
    assert_eq!(outcome.events[0].payload["rejoined"], true);
    assert_eq!(outcome.events[0].payload["participantId"], "pA");
    assert!(state.participants.get("pA-new").is_none());

    let p = state.participants.get("pA").unwrap();
    assert_eq!(p.last_seen_at, at(30));
    assert!(p.capabilities.contains("review"));
    assert_eq!(state.stats(at(31)).participants, 2);
}

#[test]
fn duplicate_participant_id_conflicts() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-p1",
            "s1",
            at(10),
            "user:carol",
            join("s1", "pA", "user:carol", &[]),
        ),
    );
    expect_code(&outcome, "CONFLICT");
}

#[test]
fn claim_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    // Dependencies unresolved.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-c1",
            "s1",
            at(3),
            "user:bob",
            claim("st2", "pB", "cx", None),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Missing capability.
    env.apply(
        &mut state,
        &env.signed(
            "tx-c2",
            "s1",
            at(4),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    env.apply(
        &mut state,
        &env.signed("tx-c3", "s1", at(5), "user:alice", resolve("st1", None)),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-c4",
            "s1",
            at(6),
            "user:alice",
            claim("st2", "pA", "cy", None),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Double claim while a lease is active.
    env.apply(
        &mut state,
        &env.signed(
            "tx-c5",
            "s1",
            at(7),
            "user:bob",
            claim("st2", "pB", "c2", None),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-c6",
            "s1",
            at(8),
            "user:bob",
            claim("st2", "pB", "c3", None),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Reused claim id.
    env.apply(
        &mut state,
        &env.signed("tx-c7", "s1", at(9), "user:bob", release("st2", "pB")),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-c8",
            "s1",
            at(10),
            "user:bob",
            claim("st2", "pB", "c2", None),
        ),
    );
    expect_code(&outcome, "CONFLICT");

    // Unknown participant.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-c9",
            "s1",
            at(11),
            "user:zed",
            claim("st2", "ghost", "c9", None),
        ),
    );
    expect_code(&outcome, "NOT_FOUND");
}

#[test]
fn release_requires_the_holder() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    env.apply(
        &mut state,
        &env.signed(
            "tx-l1",
            "s1",
            at(3),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-l2", "s1", at(4), "user:bob", release("st1", "pB")),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // After the lease expires the sweep invalidates the claim, so even the
    // original holder cannot release it.
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-l3", "s1", at(100), "user:alice", release("st1", "pA")),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
    assert_eq!(state.step("st1").unwrap().status, StepStatus::Open);
}

#[test]
fn handoff_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    env.apply(
        &mut state,
        &env.signed(
            "tx-h1",
            "s1",
            at(3),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );

    // Source does not hold the claim.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-h2",
            "s1",
            at(4),
            "user:bob",
            handoff("st1", "pB", "pA", "c2"),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Target not in session.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-h3",
            "s1",
            at(5),
            "user:alice",
            handoff("st1", "pA", "ghost", "c2"),
        ),
    );
    expect_code(&outcome, "NOT_FOUND");

    // Self-handoff.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-h4",
            "s1",
            at(6),
            "user:alice",
            handoff("st1", "pA", "pA", "c2"),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}

#[test]
fn handoff_checks_target_capabilities() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    env.apply(
        &mut state,
        &env.signed(
            "tx-hc1",
            "s1",
            at(3),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    env.apply(
        &mut state,
        &env.signed("tx-hc2", "s1", at(4), "user:alice", resolve("st1", None)),
    );
    env.apply(
        &mut state,
        &env.signed(
            "tx-hc3",
            "s1",
            at(5),
            "user:bob",
            claim("st2", "pB", "c2", None),
        ),
    );
    // pA lacks the review capability st2 requires.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-hc4",
            "s1",
            at(6),
            "user:bob",
            handoff("st2", "pB", "pA", "c3"),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}

#[test]
fn artifact_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    // No claim yet.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-f1",
            "s1",
            at(3),
            "user:alice",
            artifact("a1", "st1", "pA", json!({"v": 1})),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    env.apply(
        &mut state,
        &env.signed(
            "tx-f2",
            "s1",
            at(4),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );

    // Neither content nor external reference.
    let op = TxOp::ArtifactAdd(ArtifactAddPayload {
        artifact_id: "a1".into(),
        step_id: "st1".into(),
        producer_id: "pA".into(),
        kind: None,
        content: None,
        external_uri: None,
        content_hash: None,
        content_bytes: None,
    });
    let outcome = env.apply(&mut state, &env.signed("tx-f3", "s1", at(5), "user:alice", op));
    expect_code(&outcome, "INVALID_PARAM");

    // Both variants at once.
    let op = TxOp::ArtifactAdd(ArtifactAddPayload {
        artifact_id: "a1".into(),
        step_id: "st1".into(),
        producer_id: "pA".into(),
        kind: None,
        content: Some(json!({"v": 1})),
        external_uri: Some("s3://bucket/obj".into()),
        content_hash: Some("abc".into()),
        content_bytes: Some(10),
    });
    let outcome = env.apply(&mut state, &env.signed("tx-f4", "s1", at(6), "user:alice", op));
    expect_code(&outcome, "INVALID_PARAM");

    // External reference without a hash.
    let op = TxOp::ArtifactAdd(ArtifactAddPayload {
        artifact_id: "a1".into(),
        step_id: "st1".into(),
        producer_id: "pA".into(),
        kind: None,
        content: None,
        external_uri: Some("s3://bucket/obj".into()),
        content_hash: None,
        content_bytes: Some(10),
    });
    let outcome = env.apply(&mut state, &env.signed("tx-f5", "s1", at(7), "user:alice", op));
    expect_code(&outcome, "INVALID_PARAM");

    // Oversized inline content.
    let big = "x".repeat(65 * 1024);
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-f6",
            "s1",
            at(8),
            "user:alice",
            artifact("a1", "st1", "pA", json!({ "blob": big })),
        ),
    );
    expect_code(&outcome, "INVALID_PARAM");

    // A valid one, then an id conflict; versions stay dense.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-f7",
            "s1",
            at(9),
            "user:alice",
            artifact("a1", "st1", "pA", json!({"v": 1})),
        ),
    );
    assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-f8",
            "s1",
            at(10),
            "user:alice",
            artifact("a1", "st1", "pA", json!({"v": 2})),
        ),
    );
    expect_code(&outcome, "CONFLICT");
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-f9",
            "s1",
            at(11),
            "user:alice",
            artifact("a2", "st1", "pA", json!({"v": 2})),
        ),
    );
    assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);
    let versions: Vec<u64> = state
        .step_artifacts("st1")
        .unwrap()
        .iter()
        .map(|a| a.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[test]
fn decision_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    // Step must be claimed or in review.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-d1",
            "s1",
            at(3),
            "user:alice",
            decision_open("d1", "st1", None),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    env.apply(
        &mut state,
        &env.signed(
            "tx-d2",
            "s1",
            at(4),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-d3",
            "s1",
            at(5),
            "user:alice",
            decision_open("d1", "st1", None),
        ),
    );
    assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);

    // Only one pending decision per step.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-d4",
            "s1",
            at(6),
            "user:alice",
            decision_open("d2", "st1", None),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}

#[test]
fn vote_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    env.apply(
        &mut state,
        &env.signed(
            "tx-v1",
            "s1",
            at(3),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    let deadline = parse_rfc3339("2026-01-01T00:01:00Z").unwrap();
    let op = TxOp::DecisionOpen(DecisionOpenPayload {
        decision_id: "d1".into(),
        step_id: "st1".into(),
        policy: None,
        deadline: Some(deadline),
    });
    env.apply(&mut state, &env.signed("tx-v2", "s1", at(4), "user:alice", op));

    // Unknown decision.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-v3",
            "s1",
            at(5),
            "user:bob",
            vote("vx", "ghost", "pB", VoteChoice::Approve),
        ),
    );
    expect_code(&outcome, "NOT_FOUND");

    // Double vote by the same participant.
    env.apply(
        &mut state,
        &env.signed(
            "tx-v4",
            "s1",
            at(6),
            "user:bob",
            vote("v1", "d1", "pB", VoteChoice::Reject),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-v5",
            "s1",
            at(7),
            "user:bob",
            vote("v2", "d1", "pB", VoteChoice::Approve),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Reused vote id by someone else.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-v6",
            "s1",
            at(8),
            "user:alice",
            vote("v1", "d1", "pA", VoteChoice::Approve),
        ),
    );
    expect_code(&outcome, "CONFLICT");

    // Past the deadline the decision no longer accepts votes.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-v7",
            "s1",
            at(90),
            "user:alice",
            vote("v3", "d1", "pA", VoteChoice::Approve),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}

#[test]
fn vote_on_decided_decision_fails() {
    let env = TestEnv::new();
    let mut state = seeded(&env);
    env.apply(
        &mut state,
        &env.signed(
            "tx-w1",
            "s1",
            at(3),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    env.apply(
        &mut state,
        &env.signed(
            "tx-w2",
            "s1",
            at(4),
            "user:alice",
            decision_open("d1", "st1", None),
        ),
    );
    // Default policy: one approval passes.
    env.apply(
        &mut state,
        &env.signed(
            "tx-w3",
            "s1",
            at(5),
            "user:alice",
            vote("v1", "d1", "pA", VoteChoice::Approve),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-w4",
            "s1",
            at(6),
            "user:bob",
            vote("v2", "d1", "pB", VoteChoice::Reject),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}

#[test]
fn resolve_gates() {
    let env = TestEnv::new();
    let mut state = seeded(&env);

    // Open step cannot resolve.
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-s1", "s1", at(3), "user:alice", resolve("st1", None)),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    env.apply(
        &mut state,
        &env.signed(
            "tx-s2",
            "s1",
            at(4),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    env.apply(
        &mut state,
        &env.signed(
            "tx-s3",
            "s1",
            at(5),
            "user:alice",
            decision_open("d1", "st1", None),
        ),
    );

    // Pending decision blocks resolution.
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-s4", "s1", at(6), "user:alice", resolve("st1", Some("pA"))),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Resolve by a participant who does not hold the claim.
    env.apply(
        &mut state,
        &env.signed(
            "tx-s5",
            "s1",
            at(7),
            "user:alice",
            vote("v1", "d1", "pA", VoteChoice::Approve),
        ),
    );
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-s6", "s1", at(8), "user:bob", resolve("st1", Some("pB"))),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    // Passed decision unblocks the holder.
    let outcome = env.apply(
        &mut state,
        &env.signed("tx-s7", "s1", at(9), "user:alice", resolve("st1", Some("pA"))),
    );
    assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);
    assert_eq!(state.step("st1").unwrap().resolved_at, Some(at(9)));
}

#[test]
fn completed_session_is_immutable() {
    let env = TestEnv::new();
    let mut state = CollabState::new();
    env.apply(
        &mut state,
        &env.signed(
            "tx-m1",
            "s1",
            at(0),
            "user:alice",
            session_create("s1", "one", vec![step_spec("st1", "only", 60)]),
        ),
    );
    env.apply(
        &mut state,
        &env.signed(
            "tx-m2",
            "s1",
            at(1),
            "user:alice",
            join("s1", "pA", "user:alice", &[]),
        ),
    );
    env.apply(
        &mut state,
        &env.signed(
            "tx-m3",
            "s1",
            at(2),
            "user:alice",
            claim("st1", "pA", "c1", None),
        ),
    );
    env.apply(
        &mut state,
        &env.signed("tx-m4", "s1", at(3), "user:alice", resolve("st1", Some("pA"))),
    );
    assert_eq!(
        state.session("s1").unwrap().status,
        SessionStatus::Completed
    );

    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-m5",
            "s1",
            at(4),
            "user:carol",
            join("s1", "pC", "user:carol", &[]),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");

    let join_payload = ParticipantJoinPayload {
        session_id: "s1".into(),
        participant_id: "pD".into(),
        participant_type: ParticipantType::Agent,
        participant_ref: "agent:d".into(),
        capabilities: None,
        trust_score: None,
    };
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-m6",
            "s1",
            at(5),
            "agent:d",
            TxOp::ParticipantJoin(join_payload),
        ),
    );
    expect_code(&outcome, "PRECONDITION_FAILED");
}
