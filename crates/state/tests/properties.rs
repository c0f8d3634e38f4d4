//! Property tests: determinism, idempotency, sweep ordering and snapshot
//! stability under arbitrary transaction interleavings.

mod common;

use cohort_core::{ReceiptStatus, Tx, VoteChoice};
use cohort_state::CollabState;
use common::*;
use proptest::prelude::*;
use serde_json::json;

/// A mixed pool of transactions: valid flows, replays and rejects. Any
/// subsequence in any order must replay identically on every replica.
fn tx_pool(env: &TestEnv) -> Vec<Tx> {
    let mut pool = demo_session_txs(env);
    pool.push(env.signed(
        "tx-100",
        "s1",
        at(3),
        "user:alice",
        claim("st1", "pA", "c1", Some(5)),
    ));
    pool.push(env.signed(
        "tx-101",
        "s1",
        at(4),
        "user:alice",
        artifact("a1", "st1", "pA", json!({"text": "draft"})),
    ));
    pool.push(env.signed(
        "tx-102",
        "s1",
        at(5),
        "user:alice",
        resolve("st1", Some("pA")),
    ));
    pool.push(env.signed(
        "tx-103",
        "s1",
        at(6),
        "user:bob",
        claim("st2", "pB", "c2", Some(5)),
    ));
    pool.push(env.signed(
        "tx-104",
        "s1",
        at(7),
        "user:alice",
        decision_open("d1", "st2", None),
    ));
    pool.push(env.signed(
        "tx-105",
        "s1",
        at(8),
        "user:bob",
        vote("v1", "d1", "pB", VoteChoice::Approve),
    ));
    pool.push(env.signed(
        "tx-106",
        "s1",
        at(9),
        "user:bob",
        resolve("st2", Some("pB")),
    ));
    // Late transaction whose sweep expires whatever is still leased.
    pool.push(env.signed(
        "tx-107",
        "s1",
        at(60),
        "user:carol",
        join("s1", "pC", "user:carol", &[]),
    ));
    // Always-rejected transactions keep the rejection paths in the mix.
    pool.push(env.signed(
        "tx-108",
        "s1",
        at(10),
        "user:zed",
        claim("st1", "ghost", "c9", None),
    ));
    pool.push(env.signed(
        "tx-109",
        "s9",
        at(11),
        "user:zed",
        join("s9", "pZ", "user:zed", &[]),
    ));
    pool
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Two independently-initialized replicas fed the same sequence produce
    /// byte-identical snapshots.
    #[test]
    fn replicas_agree_on_any_interleaving(
        indices in proptest::collection::vec(0usize..13, 0..30)
    ) {
        let env = TestEnv::new();
        let pool = tx_pool(&env);
        let seq: Vec<&Tx> = indices.iter().map(|i| &pool[i % pool.len()]).collect();

        let mut a = CollabState::new();
        let mut b = CollabState::new();
        for tx in &seq {
            a.apply_tx(tx, &env.verifier);
        }
        for tx in &seq {
            b.apply_tx(tx, &env.verifier);
        }
        prop_assert_eq!(a.marshal().unwrap(), b.marshal().unwrap());
    }

    /// Applying every transaction twice in a row is equivalent to applying
    /// it once.
    #[test]
    fn double_application_is_idempotent(
        indices in proptest::collection::vec(0usize..13, 0..20)
    ) {
        let env = TestEnv::new();
        let pool = tx_pool(&env);
        let seq: Vec<&Tx> = indices.iter().map(|i| &pool[i % pool.len()]).collect();

        let mut once = CollabState::new();
        let mut twice = CollabState::new();
        for tx in &seq {
            once.apply_tx(tx, &env.verifier);
        }
        for tx in &seq {
            twice.apply_tx(tx, &env.verifier);
            let replay = twice.apply_tx(tx, &env.verifier);
            prop_assert!(replay.events.is_empty());
        }
        prop_assert_eq!(once.marshal().unwrap(), twice.marshal().unwrap());
    }

    /// Snapshot round-trips are byte-stable at any point in history.
    #[test]
    fn snapshot_round_trip_any_prefix(
        cut in 0usize..12
    ) {
        let env = TestEnv::new();
        let pool = tx_pool(&env);
        let mut state = CollabState::new();
        for tx in pool.iter().take(cut) {
            state.apply_tx(tx, &env.verifier);
        }
        let bytes = state.marshal().unwrap();
        let restored = CollabState::unmarshal(&bytes).unwrap();
        prop_assert_eq!(restored.marshal().unwrap(), bytes);
    }
}

/// The expiry sweep walks claims in lexicographic id order, so the derived
/// `CLAIM_EXPIRED` events line up identically on every replica.
#[test]
fn sweep_emits_expirations_in_claim_id_order() {
    let env = TestEnv::new();
    let mut state = CollabState::new();

    env.apply(
        &mut state,
        &env.signed(
            "tx-200",
            "s1",
            at(0),
            "user:alice",
            session_create(
                "s1",
                "fanout",
                vec![
                    step_spec("stA", "a", 60),
                    step_spec("stB", "b", 60),
                    step_spec("stC", "c", 60),
                ],
            ),
        ),
    );
    for (i, (pid, reference)) in [("p1", "user:u1"), ("p2", "user:u2"), ("p3", "user:u3")]
        .iter()
        .enumerate()
    {
        env.apply(
            &mut state,
            &env.signed(
                &format!("tx-20{}", i + 1),
                "s1",
                at(1),
                reference,
                join("s1", pid, reference, &[]),
            ),
        );
    }

    // Claim ids intentionally out of insertion order.
    let claims = [("stA", "p1", "c-z"), ("stB", "p2", "c-a"), ("stC", "p3", "c-m")];
    for (i, (step_id, pid, claim_id)) in claims.iter().enumerate() {
        // All claims share one timestamp so none expires before the last
        // one is in place.
        let outcome = env.apply(
            &mut state,
            &env.signed(
                &format!("tx-21{i}"),
                "s1",
                at(2),
                "user:any",
                claim(step_id, pid, claim_id, Some(1)),
            ),
        );
        assert_eq!(outcome.receipt.status, ReceiptStatus::Applied);
    }

    // Any later transaction triggers the sweep; all three leases are long
    // gone by now.
    let outcome = env.apply(
        &mut state,
        &env.signed(
            "tx-220",
            "s1",
            at(100),
            "user:u4",
            join("s1", "p4", "user:u4", &[]),
        ),
    );
    let expired: Vec<&str> = outcome
        .events
        .iter()
        .filter(|e| e.event_type == "CLAIM_EXPIRED")
        .map(|e| e.payload["claimId"].as_str().unwrap())
        .collect();
    assert_eq!(expired, vec!["c-a", "c-m", "c-z"]);
}
