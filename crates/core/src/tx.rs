//! The signed transaction protocol.
//!
//! Every mutation enters the cluster as a [`Tx`]: a signed, canonically
//! encoded operation. On the wire the operation is a flat `op` enum string
//! with an op-specific `payload` object; internally it is the [`TxOp`] sum
//! type so exhaustiveness checking catches missing handlers.

use crate::canonical;
use crate::model::{ParticipantType, VoteChoice};
use crate::policy::ConsensusPolicy;
use crate::time::{rfc3339_nanos, rfc3339_nanos_opt};
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A signed, canonically-encoded mutation submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    /// Globally unique; replaying an applied id is a no-op.
    pub tx_id: String,
    pub session_id: String,
    /// Caller-side deduplication tag; logged, never used for ordering.
    pub nonce: String,
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    /// Acting principal, e.g. `user:alice`.
    pub actor: String,
    #[serde(flatten)]
    pub op: TxOp,
    /// Base64 Ed25519 public key (32 bytes).
    pub public_key: String,
    /// Base64 Ed25519 signature (64 bytes) over [`Tx::signing_bytes`].
    #[serde(default)]
    pub signature: String,
}

impl Tx {
    /// An unsigned transaction; `public_key` and `signature` are filled by a
    /// signer before submission.
    pub fn unsigned(
        tx_id: impl Into<String>,
        session_id: impl Into<String>,
        nonce: impl Into<String>,
        timestamp: DateTime<Utc>,
        actor: impl Into<String>,
        op: TxOp,
    ) -> Self {
        Self {
            tx_id: tx_id.into(),
            session_id: session_id.into(),
            nonce: nonce.into(),
            timestamp,
            actor: actor.into(),
            op,
            public_key: String::new(),
            signature: String::new(),
        }
    }

    /// Canonical signing preimage: every field except `signature`, keys
    /// sorted, no insignificant whitespace.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| CoreError::Internal(format!("tx encode: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(canonical::to_canonical_vec(&value))
    }

    /// Cheap structural checks shared by the HTTP surface and the state
    /// machine; everything op-specific is validated during apply.
    pub fn validate_shape(&self) -> Result<()> {
        if self.tx_id.trim().is_empty() {
            return Err(CoreError::InvalidParam("txId is required".into()));
        }
        if self.session_id.trim().is_empty() {
            return Err(CoreError::InvalidParam("sessionId is required".into()));
        }
        if self.actor.trim().is_empty() {
            return Err(CoreError::InvalidParam("actor is required".into()));
        }
        if self.public_key.trim().is_empty() {
            return Err(CoreError::InvalidParam("publicKey is required".into()));
        }
        Ok(())
    }
}

/// The operation carried by a transaction, one variant per protocol op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxOp {
    SessionCreate(SessionCreatePayload),
    ParticipantJoin(ParticipantJoinPayload),
    StepClaim(StepClaimPayload),
    StepRelease(StepReleasePayload),
    StepHandoff(StepHandoffPayload),
    ArtifactAdd(ArtifactAddPayload),
    DecisionOpen(DecisionOpenPayload),
    VoteCast(VoteCastPayload),
    StepResolve(StepResolvePayload),
}

impl TxOp {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            TxOp::SessionCreate(_) => "SESSION_CREATE",
            TxOp::ParticipantJoin(_) => "PARTICIPANT_JOIN",
            TxOp::StepClaim(_) => "STEP_CLAIM",
            TxOp::StepRelease(_) => "STEP_RELEASE",
            TxOp::StepHandoff(_) => "STEP_HANDOFF",
            TxOp::ArtifactAdd(_) => "ARTIFACT_ADD",
            TxOp::DecisionOpen(_) => "DECISION_OPEN",
            TxOp::VoteCast(_) => "VOTE_CAST",
            TxOp::StepResolve(_) => "STEP_RESOLVE",
        }
    }
}

/// Creates a session and provisions all of its steps atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatePayload {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Step definition inside `SESSION_CREATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub step_id: String,
    pub step_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub lease_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub consensus_policy: Option<ConsensusPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinPayload {
    pub session_id: String,
    pub participant_id: String,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    #[serde(rename = "ref")]
    pub participant_ref: String,
    #[serde(default)]
    pub capabilities: Option<BTreeSet<String>>,
    #[serde(default)]
    pub trust_score: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepClaimPayload {
    pub step_id: String,
    pub participant_id: String,
    pub claim_id: String,
    #[serde(default)]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReleasePayload {
    pub step_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepHandoffPayload {
    pub step_id: String,
    pub from_participant_id: String,
    pub to_participant_id: String,
    pub new_claim_id: String,
    #[serde(default)]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactAddPayload {
    pub artifact_id: String,
    pub step_id: String,
    pub producer_id: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub external_uri: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub content_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOpenPayload {
    pub decision_id: String,
    pub step_id: String,
    #[serde(default)]
    pub policy: Option<ConsensusPolicy>,
    #[serde(default, with = "rfc3339_nanos_opt")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteCastPayload {
    pub vote_id: String,
    pub decision_id: String,
    pub participant_id: String,
    pub choice: VoteChoice,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResolvePayload {
    pub step_id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
}
