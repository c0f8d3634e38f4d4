//! Request handlers and error mapping.

use crate::ApiContext;
use chrono::Utc;
use cohort_consensus::{JoinRequest, JoinResponse, LogCommand, RpcEnvelope};
use cohort_core::{CoreError, ReceiptStatus, Tx};
use cohort_state::PageParams;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::{Rejection, Reply};

type HandlerResult = Result<warp::reply::Response, Rejection>;
type AppendEntriesReq = async_raft::raft::AppendEntriesRequest<LogCommand>;

fn json_reply<T: serde::Serialize>(value: &T) -> warp::reply::Response {
    warp::reply::json(value).into_response()
}

/// Maps the error taxonomy onto HTTP statuses, attaching the leader hint to
/// `NOT_LEADER` answers.
fn error_reply(err: &CoreError) -> warp::reply::Response {
    let status = match err {
        CoreError::InvalidParam(_)
        | CoreError::BadSignature(_)
        | CoreError::Conflict(_)
        | CoreError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
        CoreError::DeadlineExceeded(_) => StatusCode::REQUEST_TIMEOUT,
        CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    if let CoreError::NotLeader {
        leader: Some(leader),
    } = err
    {
        body["leader"] = json!(leader);
    }
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

pub async fn submit_tx(tx: Tx, ctx: Arc<ApiContext>) -> HandlerResult {
    if let Err(err) = tx.validate_shape() {
        return Ok(error_reply(&err));
    }
    if let Err(err) = ctx.verifier.verify_tx(&tx) {
        return Ok(error_reply(&err));
    }
    if !ctx.node.is_leader() {
        return Ok(error_reply(&CoreError::NotLeader {
            leader: ctx.node.leader_addr(),
        }));
    }
    debug!(tx_id = %tx.tx_id, op = tx.op.name(), "tx admitted");
    match ctx.node.submit(tx, None).await {
        Ok(receipt) => match receipt.status {
            ReceiptStatus::Applied => Ok(json_reply(&json!({
                "txId": receipt.tx_id,
                "status": "APPLIED",
            }))),
            ReceiptStatus::AlreadyApplied => Ok(json_reply(&json!({
                "txId": receipt.tx_id,
                "status": "ALREADY_APPLIED",
            }))),
            ReceiptStatus::Rejected => {
                let err = receipt
                    .rejection()
                    .unwrap_or_else(|| CoreError::Internal("rejected without a cause".into()));
                Ok(error_reply(&err))
            }
        },
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn get_session(session_id: String, ctx: Arc<ApiContext>) -> HandlerResult {
    let state = ctx.state.read();
    match state.session(&session_id) {
        Some(session) => Ok(json_reply(session)),
        None => Ok(error_reply(&CoreError::NotFound(format!(
            "session {session_id} not found"
        )))),
    }
}

pub async fn get_participants(
    session_id: String,
    page: PageParams,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    let state = ctx.state.read();
    match state.participants_page(&session_id, page) {
        Ok(participants) => Ok(json_reply(&participants)),
        Err(err) => Ok(error_reply(&err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenStepsQuery {
    participant_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn get_open_steps(
    session_id: String,
    query: OpenStepsQuery,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    let page = PageParams {
        limit: query.limit,
        offset: query.offset,
    };
    let state = ctx.state.read();
    match state.open_steps(&session_id, query.participant_id.as_deref(), Utc::now(), page) {
        Ok(steps) => Ok(json_reply(&steps)),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn get_step(step_id: String, ctx: Arc<ApiContext>) -> HandlerResult {
    let state = ctx.state.read();
    match state.step(&step_id) {
        Some(step) => Ok(json_reply(step)),
        None => Ok(error_reply(&CoreError::NotFound(format!(
            "step {step_id} not found"
        )))),
    }
}

pub async fn get_artifacts(step_id: String, ctx: Arc<ApiContext>) -> HandlerResult {
    let state = ctx.state.read();
    match state.step_artifacts(&step_id) {
        Ok(artifacts) => Ok(json_reply(&artifacts)),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn get_events(
    session_id: String,
    page: PageParams,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    let state = ctx.state.read();
    match state.events_page(&session_id, page) {
        Ok(events) => Ok(json_reply(&events)),
        Err(err) => Ok(error_reply(&err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    client_id: Option<String>,
    session_id: Option<String>,
}

pub async fn stream_events(query: StreamQuery, ctx: Arc<ApiContext>) -> HandlerResult {
    let client_id = query
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let subscription = ctx.hub.subscribe(client_id, query.session_id);
    let stream = subscription.into_stream().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(
            warp::sse::Event::default()
                .id(event.event_id)
                .event(event.event_type)
                .data(data),
        )
    });
    Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)).into_response())
}

pub async fn raft_status(ctx: Arc<ApiContext>) -> HandlerResult {
    Ok(json_reply(&ctx.node.status()))
}

pub async fn raft_join(body: JoinRequest, ctx: Arc<ApiContext>) -> HandlerResult {
    if body.node_id.trim().is_empty() || body.raft_addr.trim().is_empty() {
        return Ok(error_reply(&CoreError::InvalidParam(
            "node_id and raft_addr are required".into(),
        )));
    }
    if !ctx.node.is_leader() {
        return Ok(error_reply(&CoreError::NotLeader {
            leader: ctx.node.leader_addr(),
        }));
    }
    let raft_id = body
        .raft_id
        .unwrap_or_else(|| cohort_config::raft_id_for(&body.node_id));
    match ctx.node.add_voter(raft_id, &body.raft_addr).await {
        Ok(()) => Ok(json_reply(&JoinResponse {
            status: "ok".to_string(),
            raft_id,
            routes: ctx.node.routes().all(),
        })),
        Err(err) => Ok(error_reply(&err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    node_id: String,
    #[serde(default)]
    raft_id: Option<u64>,
}

pub async fn raft_leave(body: LeaveRequest, ctx: Arc<ApiContext>) -> HandlerResult {
    if !ctx.node.is_leader() {
        return Ok(error_reply(&CoreError::NotLeader {
            leader: ctx.node.leader_addr(),
        }));
    }
    let raft_id = body
        .raft_id
        .unwrap_or_else(|| cohort_config::raft_id_for(&body.node_id));
    match ctx.node.remove_server(raft_id).await {
        Ok(()) => Ok(json_reply(&json!({ "status": "ok", "raftId": raft_id }))),
        Err(err) => Ok(error_reply(&err)),
    }
}

pub async fn get_stats(ctx: Arc<ApiContext>) -> HandlerResult {
    let stats = ctx.state.read().stats(Utc::now());
    Ok(json_reply(&stats))
}

pub async fn healthz() -> HandlerResult {
    Ok(json_reply(&json!({ "status": "ok" })))
}

// Raft transport handlers. Transport failures map to 500; the sender
// retries per its own policy.

pub async fn raft_append_entries(
    envelope: RpcEnvelope<AppendEntriesReq>,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    match ctx.node.handle_append_entries(envelope).await {
        Ok(response) => Ok(json_reply(&response)),
        Err(err) => {
            warn!(error = %err, "append-entries handling failed");
            Ok(error_reply(&CoreError::Internal(err.to_string())))
        }
    }
}

pub async fn raft_vote(
    envelope: RpcEnvelope<async_raft::raft::VoteRequest>,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    match ctx.node.handle_vote(envelope).await {
        Ok(response) => Ok(json_reply(&response)),
        Err(err) => {
            warn!(error = %err, "vote handling failed");
            Ok(error_reply(&CoreError::Internal(err.to_string())))
        }
    }
}

pub async fn raft_install_snapshot(
    envelope: RpcEnvelope<async_raft::raft::InstallSnapshotRequest>,
    ctx: Arc<ApiContext>,
) -> HandlerResult {
    match ctx.node.handle_install_snapshot(envelope).await {
        Ok(response) => Ok(json_reply(&response)),
        Err(err) => {
            warn!(error = %err, "install-snapshot handling failed");
            Ok(error_reply(&CoreError::Internal(err.to_string())))
        }
    }
}

/// Rejections that escape the filters (bad JSON, unknown paths) still answer
/// in the error shape of the protocol.
pub async fn handle_rejection(rejection: Rejection) -> Result<warp::reply::Response, Rejection> {
    if rejection.is_not_found() {
        return Ok(error_reply(&CoreError::NotFound("no such route".into())));
    }
    if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(error_reply(&CoreError::InvalidParam(format!(
            "invalid body: {err}"
        ))));
    }
    if rejection
        .find::<warp::reject::InvalidQuery>()
        .is_some()
    {
        return Ok(error_reply(&CoreError::InvalidParam(
            "invalid query string".into(),
        )));
    }
    if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        return Ok(error_reply(&CoreError::InvalidParam(
            "method not allowed".into(),
        )));
    }
    if rejection
        .find::<warp::reject::PayloadTooLarge>()
        .is_some()
    {
        return Ok(error_reply(&CoreError::InvalidParam(
            "payload too large".into(),
        )));
    }
    warn!(?rejection, "unhandled rejection");
    Ok(error_reply(&CoreError::Internal(
        "unhandled server error".into(),
    )))
}
