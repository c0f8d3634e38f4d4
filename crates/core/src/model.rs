//! Collaboration domain entities.
//!
//! These are the records owned by the replicated state machine. All of them
//! serialize with camelCase keys and upper-case enum strings, which is both
//! the wire shape and the snapshot shape.

use crate::policy::ConsensusPolicy;
use crate::time::{rfc3339_nanos, rfc3339_nanos_opt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A running collaborative instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub workflow_id: Option<String>,
    pub name: String,
    pub status: SessionStatus,
    /// Opaque caller-supplied context, uninterpreted by the core.
    pub context: Option<Value>,
    #[serde(with = "rfc3339_nanos")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos")]
    pub updated_at: DateTime<Utc>,
    pub last_event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// A principal (human or agent) joined to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    /// Stable ref such as `user:alice`; unique per session case-insensitively.
    #[serde(rename = "ref")]
    pub participant_ref: String,
    pub capabilities: BTreeSet<String>,
    /// Carried for upper layers; the core never interprets it.
    pub trust_score: i64,
    #[serde(with = "rfc3339_nanos")]
    pub joined_at: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos")]
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantType {
    Human,
    Agent,
}

/// A unit of work in a session's DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_id: String,
    pub session_id: String,
    /// Human key, unique within the session.
    pub step_key: String,
    pub name: String,
    pub status: StepStatus,
    pub required_capabilities: BTreeSet<String>,
    /// References to other steps in the same session, by step id or step key.
    pub depends_on: Vec<String>,
    pub lease_ttl_seconds: u64,
    pub consensus_policy: Option<ConsensusPolicy>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Open,
    Claimed,
    InReview,
    Resolved,
    Failed,
}

/// A time-bounded exclusive assignment of a step to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub claim_id: String,
    pub step_id: String,
    pub participant_id: String,
    pub status: ClaimStatus,
    #[serde(with = "rfc3339_nanos")]
    pub lease_until: DateTime<Utc>,
}

impl Claim {
    /// Whether this claim holds the step at `at`.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && self.lease_until > at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Active,
    Expired,
    Released,
}

/// A versioned output submitted against a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub step_id: String,
    pub producer_id: String,
    pub kind: String,
    /// Inline variant, capped at `MAX_INLINE_ARTIFACT_BYTES`.
    pub content: Option<Value>,
    /// External variant: URI plus content hash and size.
    pub external_uri: Option<String>,
    pub content_hash: Option<String>,
    pub content_bytes: Option<u64>,
    /// Dense, monotonically increasing per step, starting at 1.
    pub version: u64,
    #[serde(with = "rfc3339_nanos")]
    pub created_at: DateTime<Utc>,
}

/// A voting process attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision_id: String,
    pub step_id: String,
    pub policy: ConsensusPolicy,
    #[serde(with = "rfc3339_nanos_opt")]
    pub deadline: Option<DateTime<Utc>>,
    pub status: DecisionStatus,
    pub result: Option<String>,
    #[serde(with = "rfc3339_nanos")]
    pub opened_at: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos_opt")]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Pending,
    Passed,
    Rejected,
}

/// One participant's vote on a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub vote_id: String,
    pub decision_id: String,
    pub participant_id: String,
    pub choice: VoteChoice,
    pub comment: Option<String>,
    #[serde(with = "rfc3339_nanos")]
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    Approve,
    Reject,
}

/// An immutable timeline entry derived from an applied transaction.
///
/// The id is a pure function of the producing transaction, the session and
/// the per-session sequence, so it is identical on every replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub session_id: String,
    pub step_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: String,
    pub payload: Value,
    #[serde(with = "rfc3339_nanos")]
    pub created_at: DateTime<Utc>,
    pub tx_id: String,
    #[serde(with = "rfc3339_nanos")]
    pub commit_time: DateTime<Utc>,
}

impl Event {
    /// Derived event identifier: `{txId}:{sessionId}:{seq:06}`.
    pub fn derive_id(tx_id: &str, session_id: &str, seq: u64) -> String {
        format!("{tx_id}:{session_id}:{seq:06}")
    }
}
