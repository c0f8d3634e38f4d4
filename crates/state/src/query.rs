//! Read-side queries over the applied state.
//!
//! Queries never mutate. Lease visibility here is computed against the
//! caller-supplied `now` (wall clock at the HTTP layer); mutations always
//! re-derive expiry from the transaction timestamp, which wins.

use crate::state::CollabState;
use chrono::{DateTime, Utc};
use cohort_core::{
    Artifact, ClaimStatus, CoreError, DecisionStatus, Event, Participant, Session, Step,
    StepStatus, DEFAULT_EVENT_PAGE, MAX_EVENT_PAGE,
};
use serde::{Deserialize, Serialize};

/// Limit/offset pair as it arrives from the query string.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageParams {
    fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    fn limit_or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).max(1)
    }
}

/// Aggregate counters served by `/v1/p2p/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub sessions: usize,
    pub participants: usize,
    pub steps: usize,
    pub open_steps: usize,
    pub claims: usize,
    pub active_claims: usize,
    pub artifacts: usize,
    pub decisions: usize,
    pub pending_decisions: usize,
    pub votes: usize,
    pub events: usize,
    pub applied_tx: usize,
}

impl CollabState {
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    pub fn is_applied(&self, tx_id: &str) -> bool {
        self.applied_tx.contains(tx_id)
    }

    /// Participants of a session, ordered by `joinedAt` then id.
    pub fn participants_page(
        &self,
        session_id: &str,
        page: PageParams,
    ) -> Result<Vec<Participant>, CoreError> {
        if !self.sessions.contains_key(session_id) {
            return Err(CoreError::NotFound(format!(
                "session {session_id} not found"
            )));
        }
        let mut participants: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        Ok(participants
            .into_iter()
            .skip(page.offset())
            .take(page.limit_or(100))
            .cloned()
            .collect())
    }

    /// Steps currently claimable: OPEN (or CLAIMED whose only claim has
    /// expired against `now` but has not been swept yet), dependencies
    /// resolved, and capabilities satisfied when a participant is given.
    pub fn open_steps(
        &self,
        session_id: &str,
        participant_id: Option<&str>,
        now: DateTime<Utc>,
        page: PageParams,
    ) -> Result<Vec<Step>, CoreError> {
        if !self.sessions.contains_key(session_id) {
            return Err(CoreError::NotFound(format!(
                "session {session_id} not found"
            )));
        }
        let capabilities = match participant_id {
            Some(participant_id) => {
                let participant = self.participants.get(participant_id).ok_or_else(|| {
                    CoreError::NotFound(format!("participant {participant_id} not found"))
                })?;
                if participant.session_id != session_id {
                    return Err(CoreError::PreconditionFailed(format!(
                        "participant {participant_id} is not in session {session_id}"
                    )));
                }
                Some(participant.capabilities.clone())
            }
            None => None,
        };

        let open: Vec<Step> = self
            .steps
            .values()
            .filter(|step| step.session_id == session_id)
            .filter(|step| match step.status {
                StepStatus::Open => true,
                StepStatus::Claimed => self.active_claim_for_step(&step.step_id, now).is_none(),
                _ => false,
            })
            .filter(|step| self.deps_resolved(step))
            .filter(|step| match &capabilities {
                Some(caps) => Self::capabilities_satisfied(&step.required_capabilities, caps),
                None => true,
            })
            .skip(page.offset())
            .take(page.limit_or(100))
            .cloned()
            .collect();
        Ok(open)
    }

    /// Artifacts of a step, ordered by version.
    pub fn step_artifacts(&self, step_id: &str) -> Result<Vec<Artifact>, CoreError> {
        if !self.steps.contains_key(step_id) {
            return Err(CoreError::NotFound(format!("step {step_id} not found")));
        }
        let mut artifacts: Vec<Artifact> = self.artifacts_for_step(step_id).cloned().collect();
        artifacts.sort_by_key(|a| a.version);
        Ok(artifacts)
    }

    /// Session timeline, newest first. The limit is clamped to [1, 500] with
    /// a default of 100.
    pub fn events_page(
        &self,
        session_id: &str,
        page: PageParams,
    ) -> Result<Vec<Event>, CoreError> {
        if !self.sessions.contains_key(session_id) {
            return Err(CoreError::NotFound(format!(
                "session {session_id} not found"
            )));
        }
        let limit = page
            .limit
            .unwrap_or(DEFAULT_EVENT_PAGE)
            .clamp(1, MAX_EVENT_PAGE);
        let timeline = self.events.get(session_id);
        Ok(timeline
            .map(|events| {
                events
                    .iter()
                    .rev()
                    .skip(page.offset())
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Aggregate counters; lease activity is judged against `now`.
    pub fn stats(&self, now: DateTime<Utc>) -> Stats {
        Stats {
            sessions: self.sessions.len(),
            participants: self.participants.len(),
            steps: self.steps.len(),
            open_steps: self
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Open)
                .count(),
            claims: self.claims.len(),
            active_claims: self
                .claims
                .values()
                .filter(|c| c.status == ClaimStatus::Active && c.lease_until > now)
                .count(),
            artifacts: self.artifacts.len(),
            decisions: self.decisions.len(),
            pending_decisions: self
                .decisions
                .values()
                .filter(|d| d.status == DecisionStatus::Pending)
                .count(),
            votes: self.votes.len(),
            events: self.events.values().map(Vec::len).sum(),
            applied_tx: self.applied_tx.len(),
        }
    }
}
