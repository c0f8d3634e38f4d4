//! State container, snapshot encoding and shared lookup helpers.

use chrono::{DateTime, Utc};
use cohort_core::canonical;
use cohort_core::{
    Artifact, Claim, CoreError, Decision, Event, Participant, Session, Step, TxReceipt, Vote,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Shared handle over the state machine.
pub type SharedState = Arc<RwLock<CollabState>>;

/// What one apply produced: the receipt for the submitter and the derived
/// events for the local fan-out hub.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub receipt: TxReceipt,
    pub events: Vec<Event>,
}

/// The full replicated snapshot. Everything lives in `BTreeMap`s so that
/// iteration order, and therefore the canonical encoding, is stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabState {
    pub sessions: BTreeMap<String, Session>,
    pub participants: BTreeMap<String, Participant>,
    pub steps: BTreeMap<String, Step>,
    pub claims: BTreeMap<String, Claim>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub decisions: BTreeMap<String, Decision>,
    pub votes: BTreeMap<String, Vote>,
    /// Append-only per-session timelines.
    pub events: BTreeMap<String, Vec<Event>>,
    /// Transaction ids already applied; replays are no-ops.
    pub applied_tx: BTreeSet<String>,

    /// Derived: session id -> step key -> step id. Rebuilt on restore,
    /// excluded from the snapshot.
    #[serde(skip)]
    pub(crate) step_key_index: BTreeMap<String, BTreeMap<String, String>>,
}

impl CollabState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical snapshot bytes. Derived caches are excluded.
    pub fn marshal(&self) -> Result<Vec<u8>, CoreError> {
        canonical::canonicalize(self)
    }

    /// Replaces state from snapshot bytes and rebuilds derived indexes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut state: CollabState = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Internal(format!("snapshot decode: {e}")))?;
        state.rebuild_indexes();
        Ok(state)
    }

    /// Rebuilds the `stepKey -> stepId` index from the materialized steps.
    pub fn rebuild_indexes(&mut self) {
        self.step_key_index.clear();
        for step in self.steps.values() {
            self.step_key_index
                .entry(step.session_id.clone())
                .or_default()
                .insert(step.step_key.clone(), step.step_id.clone());
        }
    }

    pub(crate) fn index_step_key(&mut self, session_id: &str, step_key: &str, step_id: &str) {
        self.step_key_index
            .entry(session_id.to_string())
            .or_default()
            .insert(step_key.to_string(), step_id.to_string());
    }

    /// Resolves a `dependsOn` entry within a session: step id first, then
    /// step key.
    pub(crate) fn resolve_step_ref(&self, session_id: &str, reference: &str) -> Option<&Step> {
        if let Some(step) = self.steps.get(reference) {
            if step.session_id == session_id {
                return Some(step);
            }
        }
        let step_id = self.step_key_index.get(session_id)?.get(reference)?;
        self.steps.get(step_id)
    }

    /// All dependencies of a step are materialized and RESOLVED.
    pub(crate) fn deps_resolved(&self, step: &Step) -> bool {
        step.depends_on.iter().all(|dep| {
            self.resolve_step_ref(&step.session_id, dep)
                .map(|s| s.status == cohort_core::StepStatus::Resolved)
                .unwrap_or(false)
        })
    }

    /// `required ⊆ capabilities`, case-sensitive after trim; an empty
    /// requirement set is always satisfied.
    pub(crate) fn capabilities_satisfied(
        required: &BTreeSet<String>,
        capabilities: &BTreeSet<String>,
    ) -> bool {
        required.iter().all(|req| {
            let req = req.trim();
            req.is_empty() || capabilities.iter().any(|cap| cap.trim() == req)
        })
    }

    pub(crate) fn find_participant_by_ref(
        &self,
        session_id: &str,
        participant_ref: &str,
    ) -> Option<&Participant> {
        let wanted = participant_ref.trim().to_lowercase();
        // BTreeMap order keeps the scan deterministic.
        self.participants.values().find(|p| {
            p.session_id == session_id && p.participant_ref.trim().to_lowercase() == wanted
        })
    }

    pub(crate) fn active_claim_for_step(&self, step_id: &str, at: DateTime<Utc>) -> Option<&Claim> {
        self.claims
            .values()
            .find(|c| c.step_id == step_id && c.is_active_at(at))
    }

    pub(crate) fn artifacts_for_step(&self, step_id: &str) -> impl Iterator<Item = &Artifact> {
        let step_id = step_id.to_string();
        self.artifacts
            .values()
            .filter(move |a| a.step_id == step_id)
    }

    pub(crate) fn decisions_for_step(&self, step_id: &str) -> impl Iterator<Item = &Decision> {
        let step_id = step_id.to_string();
        self.decisions
            .values()
            .filter(move |d| d.step_id == step_id)
    }

    pub(crate) fn votes_for_decision(&self, decision_id: &str) -> impl Iterator<Item = &Vote> {
        let decision_id = decision_id.to_string();
        self.votes
            .values()
            .filter(move |v| v.decision_id == decision_id)
    }

    /// Appends a derived event to the session timeline and touches the
    /// session. The event id is a pure function of the producing tx, the
    /// session and the per-session sequence.
    pub(crate) fn append_event(
        &mut self,
        session_id: &str,
        step_id: Option<String>,
        event_type: &str,
        actor: &str,
        payload: Value,
        at: DateTime<Utc>,
        tx_id: &str,
    ) -> Event {
        let timeline = self.events.entry(session_id.to_string()).or_default();
        let seq = timeline.len() as u64 + 1;
        let event = Event {
            event_id: Event::derive_id(tx_id, session_id, seq),
            session_id: session_id.to_string(),
            step_id,
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            payload,
            created_at: at,
            tx_id: tx_id.to_string(),
            commit_time: at,
        };
        timeline.push(event.clone());
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_event_id = Some(event.event_id.clone());
            session.updated_at = at;
        }
        event
    }
}
