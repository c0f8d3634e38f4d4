//! Core protocol and domain model for the cohort collaboration cluster.
//!
//! This crate defines the signed transaction protocol (canonical encoding,
//! operation payloads), the collaboration entities kept by the replicated
//! state machine, and the error taxonomy shared by every layer.

pub mod canonical;
pub mod error;
pub mod model;
pub mod policy;
pub mod receipt;
pub mod time;
pub mod tx;

pub use error::{CoreError, Result};
pub use model::{
    Artifact, Claim, ClaimStatus, Decision, DecisionStatus, Event, Participant, ParticipantType,
    Session, SessionStatus, Step, StepStatus, Vote, VoteChoice,
};
pub use policy::{ConsensusPolicy, PolicyVerdict};
pub use receipt::{ReceiptError, ReceiptStatus, TxReceipt};
pub use tx::{
    ArtifactAddPayload, DecisionOpenPayload, ParticipantJoinPayload, SessionCreatePayload,
    StepClaimPayload, StepHandoffPayload, StepReleasePayload, StepResolvePayload, StepSpec, Tx,
    TxOp, VoteCastPayload,
};

/// Inline artifact content above this canonical-encoded size must be stored
/// externally and referenced by URI + hash.
pub const MAX_INLINE_ARTIFACT_BYTES: usize = 64 * 1024;

/// Lease applied to a claim when neither the claim nor the step specifies one.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;

/// Hard cap on the event page size served by the query surface.
pub const MAX_EVENT_PAGE: usize = 500;

/// Event page size when the caller does not ask for one.
pub const DEFAULT_EVENT_PAGE: usize = 100;
