//! Transaction apply: validation, mutation and derived events.
//!
//! Handlers validate fully before mutating, so a rejected operation leaves
//! the state untouched. The lease sweep that precedes dispatch is part of
//! the transaction's arrival, not of the operation, and its effects stand
//! either way, identically on every replica.

use crate::state::{CollabState, TxOutcome};
use chrono::{DateTime, Duration, Utc};
use cohort_core::time::format_rfc3339_nanos;
use cohort_core::{
    Artifact, ArtifactAddPayload, Claim, ClaimStatus, CoreError, Decision, DecisionOpenPayload,
    DecisionStatus, Event, Participant, ParticipantJoinPayload, PolicyVerdict, Session,
    SessionCreatePayload, SessionStatus, Step, StepClaimPayload, StepHandoffPayload,
    StepReleasePayload, StepResolvePayload, StepStatus, Tx, TxOp, TxReceipt, Vote,
    VoteCastPayload, VoteChoice, DEFAULT_LEASE_TTL_SECS, MAX_INLINE_ARTIFACT_BYTES,
};
use cohort_crypto::TxVerifier;
use serde_json::json;
use tracing::debug;

impl CollabState {
    /// Applies one transaction in committed-log order.
    ///
    /// Never returns an error: rejections ride inside the receipt so that a
    /// committed-but-invalid transaction is a deterministic no-op everywhere
    /// instead of a consensus fault.
    pub fn apply_tx(&mut self, tx: &Tx, verifier: &dyn TxVerifier) -> TxOutcome {
        if let Err(err) = verifier.verify_tx(tx) {
            return TxOutcome {
                receipt: TxReceipt::rejected(&tx.tx_id, &err),
                events: Vec::new(),
            };
        }
        if let Err(err) = tx.validate_shape() {
            return TxOutcome {
                receipt: TxReceipt::rejected(&tx.tx_id, &err),
                events: Vec::new(),
            };
        }
        if self.applied_tx.contains(&tx.tx_id) {
            debug!(tx_id = %tx.tx_id, "replayed tx, no-op");
            return TxOutcome {
                receipt: TxReceipt::already_applied(&tx.tx_id),
                events: Vec::new(),
            };
        }

        // All time in apply derives from the transaction itself.
        let at = tx.timestamp;
        let mut events = self.sweep_expired_leases(at, &tx.tx_id);

        match self.dispatch(tx, at) {
            Ok(mut op_events) => {
                events.append(&mut op_events);
                self.applied_tx.insert(tx.tx_id.clone());
                TxOutcome {
                    receipt: TxReceipt::applied(&tx.tx_id),
                    events,
                }
            }
            Err(err) => {
                debug!(tx_id = %tx.tx_id, op = tx.op.name(), error = %err, "tx rejected");
                TxOutcome {
                    receipt: TxReceipt::rejected(&tx.tx_id, &err),
                    events,
                }
            }
        }
    }

    /// Expires every active claim whose lease has passed, in lexicographic
    /// claim-id order, reopening steps left without a holder.
    fn sweep_expired_leases(&mut self, at: DateTime<Utc>, tx_id: &str) -> Vec<Event> {
        let expired: Vec<String> = self
            .claims
            .iter()
            .filter(|(_, c)| c.status == ClaimStatus::Active && c.lease_until <= at)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for claim_id in expired {
            let (step_id, participant_id, lease_until) = match self.claims.get_mut(&claim_id) {
                Some(claim) => {
                    claim.status = ClaimStatus::Expired;
                    (
                        claim.step_id.clone(),
                        claim.participant_id.clone(),
                        claim.lease_until,
                    )
                }
                None => continue,
            };
            let (session_id, was_claimed) = match self.steps.get(&step_id) {
                Some(step) => (
                    step.session_id.clone(),
                    step.status == StepStatus::Claimed,
                ),
                None => continue,
            };
            let other_active = self.active_claim_for_step(&step_id, at).is_some();
            if was_claimed && !other_active {
                if let Some(step) = self.steps.get_mut(&step_id) {
                    step.status = StepStatus::Open;
                }
            }
            events.push(self.append_event(
                &session_id,
                Some(step_id),
                "CLAIM_EXPIRED",
                "system",
                json!({
                    "claimId": claim_id,
                    "participantId": participant_id,
                    "leaseUntil": format_rfc3339_nanos(&lease_until),
                }),
                at,
                tx_id,
            ));
        }
        events
    }

    fn dispatch(&mut self, tx: &Tx, at: DateTime<Utc>) -> Result<Vec<Event>, CoreError> {
        match &tx.op {
            TxOp::SessionCreate(p) => self.apply_session_create(tx, at, p),
            TxOp::ParticipantJoin(p) => self.apply_participant_join(tx, at, p),
            TxOp::StepClaim(p) => self.apply_step_claim(tx, at, p),
            TxOp::StepRelease(p) => self.apply_step_release(tx, at, p),
            TxOp::StepHandoff(p) => self.apply_step_handoff(tx, at, p),
            TxOp::ArtifactAdd(p) => self.apply_artifact_add(tx, at, p),
            TxOp::DecisionOpen(p) => self.apply_decision_open(tx, at, p),
            TxOp::VoteCast(p) => self.apply_vote_cast(tx, at, p),
            TxOp::StepResolve(p) => self.apply_step_resolve(tx, at, p),
        }
    }

    fn apply_session_create(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &SessionCreatePayload,
    ) -> Result<Vec<Event>, CoreError> {
        if p.session_id != tx.session_id {
            return Err(CoreError::InvalidParam(
                "payload sessionId does not match tx sessionId".into(),
            ));
        }
        if p.name.trim().is_empty() {
            return Err(CoreError::InvalidParam("session name is required".into()));
        }
        if self.sessions.contains_key(&p.session_id) {
            return Err(CoreError::Conflict(format!(
                "session {} already exists",
                p.session_id
            )));
        }

        let mut seen_ids = std::collections::BTreeSet::new();
        let mut seen_keys = std::collections::BTreeSet::new();
        for spec in &p.steps {
            if spec.step_id.trim().is_empty() {
                return Err(CoreError::InvalidParam("stepId is required".into()));
            }
            if spec.step_key.trim().is_empty() {
                return Err(CoreError::InvalidParam("stepKey is required".into()));
            }
            if self.steps.contains_key(&spec.step_id) || !seen_ids.insert(spec.step_id.clone()) {
                return Err(CoreError::Conflict(format!(
                    "step {} already exists",
                    spec.step_id
                )));
            }
            if !seen_keys.insert(spec.step_key.clone()) {
                return Err(CoreError::PreconditionFailed(format!(
                    "duplicate stepKey {} in session {}",
                    spec.step_key, p.session_id
                )));
            }
            if spec.lease_ttl_seconds == Some(0) {
                return Err(CoreError::InvalidParam(
                    "leaseTtlSeconds must be positive".into(),
                ));
            }
        }

        self.sessions.insert(
            p.session_id.clone(),
            Session {
                session_id: p.session_id.clone(),
                workflow_id: p.workflow_id.clone(),
                name: p.name.clone(),
                status: SessionStatus::Active,
                context: p.context.clone(),
                created_at: at,
                updated_at: at,
                last_event_id: None,
            },
        );
        for spec in &p.steps {
            let step = Step {
                step_id: spec.step_id.clone(),
                session_id: p.session_id.clone(),
                step_key: spec.step_key.clone(),
                name: spec.name.clone().unwrap_or_else(|| spec.step_key.clone()),
                status: StepStatus::Open,
                required_capabilities: spec.required_capabilities.clone(),
                depends_on: spec.depends_on.clone(),
                lease_ttl_seconds: spec.lease_ttl_seconds.unwrap_or(DEFAULT_LEASE_TTL_SECS),
                consensus_policy: spec.consensus_policy,
                resolved_at: None,
            };
            self.index_step_key(&p.session_id, &step.step_key, &step.step_id);
            self.steps.insert(step.step_id.clone(), step);
        }

        Ok(vec![self.append_event(
            &p.session_id,
            None,
            "SESSION_CREATED",
            &tx.actor,
            json!({
                "name": p.name,
                "workflowId": p.workflow_id,
                "steps": p.steps.len(),
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_participant_join(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &ParticipantJoinPayload,
    ) -> Result<Vec<Event>, CoreError> {
        if p.session_id != tx.session_id {
            return Err(CoreError::InvalidParam(
                "payload sessionId does not match tx sessionId".into(),
            ));
        }
        if p.participant_ref.trim().is_empty() {
            return Err(CoreError::InvalidParam("ref is required".into()));
        }
        self.require_active_session(&p.session_id)?;

        // A re-join with a known ref is a touch, not a new participant.
        if let Some(existing) = self
            .find_participant_by_ref(&p.session_id, &p.participant_ref)
            .map(|e| e.participant_id.clone())
        {
            if let Some(participant) = self.participants.get_mut(&existing) {
                participant.last_seen_at = at;
                if let Some(capabilities) = &p.capabilities {
                    participant.capabilities = capabilities.clone();
                }
                if let Some(trust_score) = p.trust_score {
                    participant.trust_score = trust_score;
                }
            }
            return Ok(vec![self.append_event(
                &p.session_id,
                None,
                "PARTICIPANT_JOINED",
                &tx.actor,
                json!({
                    "participantId": existing,
                    "ref": p.participant_ref,
                    "rejoined": true,
                }),
                at,
                &tx.tx_id,
            )]);
        }

        if p.participant_id.trim().is_empty() {
            return Err(CoreError::InvalidParam("participantId is required".into()));
        }
        if self.participants.contains_key(&p.participant_id) {
            return Err(CoreError::Conflict(format!(
                "participant {} already exists",
                p.participant_id
            )));
        }

        self.participants.insert(
            p.participant_id.clone(),
            Participant {
                participant_id: p.participant_id.clone(),
                session_id: p.session_id.clone(),
                participant_type: p.participant_type,
                participant_ref: p.participant_ref.clone(),
                capabilities: p.capabilities.clone().unwrap_or_default(),
                trust_score: p.trust_score.unwrap_or(0),
                joined_at: at,
                last_seen_at: at,
            },
        );

        Ok(vec![self.append_event(
            &p.session_id,
            None,
            "PARTICIPANT_JOINED",
            &tx.actor,
            json!({
                "participantId": p.participant_id,
                "ref": p.participant_ref,
                "type": p.participant_type,
                "rejoined": false,
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_step_claim(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &StepClaimPayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        let step_status = step.status;
        let required = step.required_capabilities.clone();
        let step_ttl = step.lease_ttl_seconds;
        self.require_active_session(&session_id)?;
        let participant = self.require_participant_in_session(&p.participant_id, &session_id)?;
        let capabilities = participant.capabilities.clone();

        if self.claims.contains_key(&p.claim_id) {
            return Err(CoreError::Conflict(format!(
                "claim {} already exists",
                p.claim_id
            )));
        }
        if step_status != StepStatus::Open {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} is not open",
                p.step_id
            )));
        }
        let step = match self.steps.get(&p.step_id) {
            Some(step) => step,
            None => return Err(CoreError::NotFound(format!("step {} not found", p.step_id))),
        };
        if !self.deps_resolved(step) {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} has unresolved dependencies",
                p.step_id
            )));
        }
        if !Self::capabilities_satisfied(&required, &capabilities) {
            return Err(CoreError::PreconditionFailed(format!(
                "participant {} lacks required capabilities",
                p.participant_id
            )));
        }
        if self.active_claim_for_step(&p.step_id, at).is_some() {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} already has an active claim",
                p.step_id
            )));
        }
        let lease_seconds = p.lease_seconds.unwrap_or(step_ttl);
        if lease_seconds == 0 {
            return Err(CoreError::InvalidParam(
                "leaseSeconds must be positive".into(),
            ));
        }
        let lease_until = at + Duration::seconds(lease_seconds as i64);

        self.claims.insert(
            p.claim_id.clone(),
            Claim {
                claim_id: p.claim_id.clone(),
                step_id: p.step_id.clone(),
                participant_id: p.participant_id.clone(),
                status: ClaimStatus::Active,
                lease_until,
            },
        );
        if let Some(step) = self.steps.get_mut(&p.step_id) {
            step.status = StepStatus::Claimed;
        }

        Ok(vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "STEP_CLAIMED",
            &tx.actor,
            json!({
                "claimId": p.claim_id,
                "participantId": p.participant_id,
                "leaseUntil": format_rfc3339_nanos(&lease_until),
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_step_release(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &StepReleasePayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        self.require_active_session(&session_id)?;

        let claim_id = self
            .active_claim_for_step(&p.step_id, at)
            .filter(|c| c.participant_id == p.participant_id)
            .map(|c| c.claim_id.clone())
            .ok_or_else(|| {
                CoreError::PreconditionFailed(format!(
                    "participant {} does not hold an active claim on step {}",
                    p.participant_id, p.step_id
                ))
            })?;

        if let Some(claim) = self.claims.get_mut(&claim_id) {
            claim.status = ClaimStatus::Released;
        }
        if let Some(step) = self.steps.get_mut(&p.step_id) {
            step.status = StepStatus::Open;
        }

        Ok(vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "STEP_RELEASED",
            &tx.actor,
            json!({
                "claimId": claim_id,
                "participantId": p.participant_id,
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_step_handoff(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &StepHandoffPayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        let required = step.required_capabilities.clone();
        let step_ttl = step.lease_ttl_seconds;
        self.require_active_session(&session_id)?;

        if p.to_participant_id == p.from_participant_id {
            return Err(CoreError::PreconditionFailed(
                "handoff target must differ from the current holder".into(),
            ));
        }
        let source_claim_id = self
            .active_claim_for_step(&p.step_id, at)
            .filter(|c| c.participant_id == p.from_participant_id)
            .map(|c| c.claim_id.clone())
            .ok_or_else(|| {
                CoreError::PreconditionFailed(format!(
                    "participant {} does not hold an active claim on step {}",
                    p.from_participant_id, p.step_id
                ))
            })?;
        let target = self.require_participant_in_session(&p.to_participant_id, &session_id)?;
        if !Self::capabilities_satisfied(&required, &target.capabilities) {
            return Err(CoreError::PreconditionFailed(format!(
                "participant {} lacks required capabilities",
                p.to_participant_id
            )));
        }
        if self.claims.contains_key(&p.new_claim_id) {
            return Err(CoreError::Conflict(format!(
                "claim {} already exists",
                p.new_claim_id
            )));
        }
        let lease_seconds = p.lease_seconds.unwrap_or(step_ttl);
        if lease_seconds == 0 {
            return Err(CoreError::InvalidParam(
                "leaseSeconds must be positive".into(),
            ));
        }
        let lease_until = at + Duration::seconds(lease_seconds as i64);

        if let Some(claim) = self.claims.get_mut(&source_claim_id) {
            claim.status = ClaimStatus::Released;
        }
        self.claims.insert(
            p.new_claim_id.clone(),
            Claim {
                claim_id: p.new_claim_id.clone(),
                step_id: p.step_id.clone(),
                participant_id: p.to_participant_id.clone(),
                status: ClaimStatus::Active,
                lease_until,
            },
        );

        Ok(vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "STEP_HANDED_OFF",
            &tx.actor,
            json!({
                "fromParticipantId": p.from_participant_id,
                "toParticipantId": p.to_participant_id,
                "releasedClaimId": source_claim_id,
                "newClaimId": p.new_claim_id,
                "leaseUntil": format_rfc3339_nanos(&lease_until),
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_artifact_add(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &ArtifactAddPayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        let step_status = step.status;
        self.require_active_session(&session_id)?;

        self.active_claim_for_step(&p.step_id, at)
            .filter(|c| c.participant_id == p.producer_id)
            .ok_or_else(|| {
                CoreError::PreconditionFailed(format!(
                    "producer {} does not hold an active claim on step {}",
                    p.producer_id, p.step_id
                ))
            })?;
        if self.artifacts.contains_key(&p.artifact_id) {
            return Err(CoreError::Conflict(format!(
                "artifact {} already exists",
                p.artifact_id
            )));
        }

        let external = p.external_uri.as_deref().map(str::trim).unwrap_or("");
        match (&p.content, external.is_empty()) {
            (Some(content), true) => {
                let encoded = cohort_core::canonical::canonicalize(content)?;
                if encoded.len() > MAX_INLINE_ARTIFACT_BYTES {
                    return Err(CoreError::InvalidParam(format!(
                        "inline content exceeds {MAX_INLINE_ARTIFACT_BYTES} bytes; store it externally"
                    )));
                }
            }
            (None, false) => {
                if p.content_hash.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(CoreError::InvalidParam(
                        "externalUri requires contentHash".into(),
                    ));
                }
                if p.content_bytes.unwrap_or(0) == 0 {
                    return Err(CoreError::InvalidParam(
                        "externalUri requires a positive contentBytes".into(),
                    ));
                }
            }
            (Some(_), false) => {
                return Err(CoreError::InvalidParam(
                    "content and externalUri are mutually exclusive".into(),
                ));
            }
            (None, true) => {
                return Err(CoreError::InvalidParam(
                    "either content or externalUri is required".into(),
                ));
            }
        }

        let version = self
            .artifacts_for_step(&p.step_id)
            .map(|a| a.version)
            .max()
            .unwrap_or(0)
            + 1;

        self.artifacts.insert(
            p.artifact_id.clone(),
            Artifact {
                artifact_id: p.artifact_id.clone(),
                step_id: p.step_id.clone(),
                producer_id: p.producer_id.clone(),
                kind: p.kind.clone().unwrap_or_else(|| "artifact".to_string()),
                content: p.content.clone(),
                external_uri: p.external_uri.clone().filter(|u| !u.trim().is_empty()),
                content_hash: p.content_hash.clone(),
                content_bytes: p.content_bytes,
                version,
                created_at: at,
            },
        );
        if step_status == StepStatus::Claimed {
            if let Some(step) = self.steps.get_mut(&p.step_id) {
                step.status = StepStatus::InReview;
            }
        }

        Ok(vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "ARTIFACT_ADDED",
            &tx.actor,
            json!({
                "artifactId": p.artifact_id,
                "producerId": p.producer_id,
                "version": version,
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_decision_open(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &DecisionOpenPayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        let step_status = step.status;
        let step_policy = step.consensus_policy;
        self.require_active_session(&session_id)?;

        if !matches!(step_status, StepStatus::Claimed | StepStatus::InReview) {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} is not claimed or in review",
                p.step_id
            )));
        }
        if self
            .decisions_for_step(&p.step_id)
            .any(|d| d.status == DecisionStatus::Pending)
        {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} already has a pending decision",
                p.step_id
            )));
        }
        if self.decisions.contains_key(&p.decision_id) {
            return Err(CoreError::Conflict(format!(
                "decision {} already exists",
                p.decision_id
            )));
        }

        let policy = p
            .policy
            .or(step_policy)
            .unwrap_or_default()
            .normalize();
        self.decisions.insert(
            p.decision_id.clone(),
            Decision {
                decision_id: p.decision_id.clone(),
                step_id: p.step_id.clone(),
                policy,
                deadline: p.deadline,
                status: DecisionStatus::Pending,
                result: None,
                opened_at: at,
                decided_at: None,
            },
        );

        Ok(vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "DECISION_OPENED",
            &tx.actor,
            json!({
                "decisionId": p.decision_id,
                "policy": policy,
                "deadline": p.deadline.map(|d| format_rfc3339_nanos(&d)),
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_vote_cast(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &VoteCastPayload,
    ) -> Result<Vec<Event>, CoreError> {
        let decision = self.decisions.get(&p.decision_id).ok_or_else(|| {
            CoreError::NotFound(format!("decision {} not found", p.decision_id))
        })?;
        let step_id = decision.step_id.clone();
        let policy = decision.policy;
        let deadline = decision.deadline;
        let status = decision.status;

        let step = self.require_step(&step_id)?;
        let session_id = step.session_id.clone();
        self.require_active_session(&session_id)?;
        self.require_participant_in_session(&p.participant_id, &session_id)?;

        if status != DecisionStatus::Pending {
            return Err(CoreError::PreconditionFailed(format!(
                "decision {} is already decided",
                p.decision_id
            )));
        }
        if let Some(deadline) = deadline {
            if at > deadline {
                return Err(CoreError::PreconditionFailed(format!(
                    "decision {} deadline has passed",
                    p.decision_id
                )));
            }
        }
        if self.votes.contains_key(&p.vote_id) {
            return Err(CoreError::Conflict(format!(
                "vote {} already exists",
                p.vote_id
            )));
        }
        if self
            .votes_for_decision(&p.decision_id)
            .any(|v| v.participant_id == p.participant_id)
        {
            return Err(CoreError::PreconditionFailed(format!(
                "participant {} already voted on decision {}",
                p.participant_id, p.decision_id
            )));
        }

        self.votes.insert(
            p.vote_id.clone(),
            Vote {
                vote_id: p.vote_id.clone(),
                decision_id: p.decision_id.clone(),
                participant_id: p.participant_id.clone(),
                choice: p.choice,
                comment: p.comment.clone(),
                cast_at: at,
            },
        );

        // Evaluate the policy against the new tally.
        let (mut approves, mut rejects) = (0i64, 0i64);
        for vote in self.votes_for_decision(&p.decision_id) {
            match vote.choice {
                VoteChoice::Approve => approves += 1,
                VoteChoice::Reject => rejects += 1,
            }
        }
        let total = approves + rejects;
        let verdict = policy.evaluate(approves, rejects, total);
        let new_status = match verdict {
            PolicyVerdict::Passed => DecisionStatus::Passed,
            PolicyVerdict::Rejected => DecisionStatus::Rejected,
            PolicyVerdict::Pending => DecisionStatus::Pending,
        };
        if new_status != DecisionStatus::Pending {
            if let Some(decision) = self.decisions.get_mut(&p.decision_id) {
                decision.status = new_status;
                decision.decided_at = Some(at);
                decision.result = Some(format!("{approves} approve / {rejects} reject"));
            }
        }

        Ok(vec![self.append_event(
            &session_id,
            Some(step_id),
            "VOTE_CAST",
            &tx.actor,
            json!({
                "voteId": p.vote_id,
                "decisionId": p.decision_id,
                "participantId": p.participant_id,
                "choice": p.choice,
                "decisionStatus": new_status,
            }),
            at,
            &tx.tx_id,
        )])
    }

    fn apply_step_resolve(
        &mut self,
        tx: &Tx,
        at: DateTime<Utc>,
        p: &StepResolvePayload,
    ) -> Result<Vec<Event>, CoreError> {
        let step = self.require_step(&p.step_id)?;
        let session_id = step.session_id.clone();
        let step_status = step.status;
        self.require_active_session(&session_id)?;

        if !matches!(step_status, StepStatus::Claimed | StepStatus::InReview) {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} is not claimed or in review",
                p.step_id
            )));
        }
        if self
            .decisions_for_step(&p.step_id)
            .any(|d| d.status == DecisionStatus::Pending)
        {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} has a pending decision",
                p.step_id
            )));
        }
        // The latest decision governs; earlier rejected rounds may have been
        // superseded by a passed one.
        let latest = self
            .decisions_for_step(&p.step_id)
            .max_by(|a, b| {
                a.opened_at
                    .cmp(&b.opened_at)
                    .then_with(|| a.decision_id.cmp(&b.decision_id))
            })
            .map(|d| d.status);
        if latest == Some(DecisionStatus::Rejected) {
            return Err(CoreError::PreconditionFailed(format!(
                "step {} decision was rejected",
                p.step_id
            )));
        }
        if let Some(participant_id) = &p.participant_id {
            self.active_claim_for_step(&p.step_id, at)
                .filter(|c| &c.participant_id == participant_id)
                .ok_or_else(|| {
                    CoreError::PreconditionFailed(format!(
                        "participant {participant_id} does not hold an active claim on step {}",
                        p.step_id
                    ))
                })?;
        }

        // Release whatever still holds the step, then resolve it.
        let holding: Vec<String> = self
            .claims
            .values()
            .filter(|c| c.step_id == p.step_id && c.status == ClaimStatus::Active)
            .map(|c| c.claim_id.clone())
            .collect();
        for claim_id in holding {
            if let Some(claim) = self.claims.get_mut(&claim_id) {
                claim.status = ClaimStatus::Released;
            }
        }
        if let Some(step) = self.steps.get_mut(&p.step_id) {
            step.status = StepStatus::Resolved;
            step.resolved_at = Some(at);
        }

        let mut events = vec![self.append_event(
            &session_id,
            Some(p.step_id.clone()),
            "STEP_RESOLVED",
            &tx.actor,
            json!({
                "participantId": p.participant_id,
            }),
            at,
            &tx.tx_id,
        )];

        // Resolution cascade: a session with every step resolved completes.
        let all_resolved = self
            .steps
            .values()
            .filter(|s| s.session_id == session_id)
            .all(|s| s.status == StepStatus::Resolved);
        if all_resolved {
            let step_count = self
                .steps
                .values()
                .filter(|s| s.session_id == session_id)
                .count();
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.status = SessionStatus::Completed;
            }
            events.push(self.append_event(
                &session_id,
                None,
                "SESSION_COMPLETED",
                &tx.actor,
                json!({ "steps": step_count }),
                at,
                &tx.tx_id,
            ));
        }

        Ok(events)
    }

    fn require_step(&self, step_id: &str) -> Result<&Step, CoreError> {
        self.steps
            .get(step_id)
            .ok_or_else(|| CoreError::NotFound(format!("step {step_id} not found")))
    }

    fn require_active_session(&self, session_id: &str) -> Result<&Session, CoreError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id} not found")))?;
        if session.status != SessionStatus::Active {
            return Err(CoreError::PreconditionFailed(format!(
                "session {session_id} is not active"
            )));
        }
        Ok(session)
    }

    fn require_participant_in_session(
        &self,
        participant_id: &str,
        session_id: &str,
    ) -> Result<&Participant, CoreError> {
        let participant = self.participants.get(participant_id).ok_or_else(|| {
            CoreError::NotFound(format!("participant {participant_id} not found"))
        })?;
        if participant.session_id != session_id {
            return Err(CoreError::PreconditionFailed(format!(
                "participant {participant_id} is not in session {session_id}"
            )));
        }
        Ok(participant)
    }
}
