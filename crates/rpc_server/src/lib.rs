//! HTTP surface of a cohort node.
//!
//! Commands and queries live under `/v1/p2p`; the internal Raft transport
//! consumed by peers lives under `/v1/raft`. Writes are admitted only on the
//! leader (followers answer 421 with a leader hint); reads are served from
//! this replica's applied state.

mod handlers;

use cohort_consensus::ConsensusNode;
use cohort_crypto::TxVerifier;
use cohort_events::EventHub;
use cohort_state::SharedState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;
use warp::{Filter, Rejection, Reply};

/// Everything the handlers need, shared across requests.
pub struct ApiContext {
    pub node_id: String,
    pub state: SharedState,
    pub node: Arc<ConsensusNode>,
    pub hub: Arc<EventHub>,
    pub verifier: Arc<dyn TxVerifier>,
}

fn with_ctx(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = (Arc<ApiContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// The full route tree, rejection handling included.
pub fn routes(
    ctx: Arc<ApiContext>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let tx = warp::path!("v1" / "p2p" / "tx")
        .and(warp::post())
        .and(warp::body::content_length_limit(1024 * 1024))
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::submit_tx);

    let session = warp::path!("v1" / "p2p" / "sessions" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_session);

    let participants = warp::path!("v1" / "p2p" / "sessions" / String / "participants")
        .and(warp::get())
        .and(warp::query())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_participants);

    let open_steps = warp::path!("v1" / "p2p" / "sessions" / String / "steps" / "open")
        .and(warp::get())
        .and(warp::query())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_open_steps);

    let step = warp::path!("v1" / "p2p" / "steps" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_step);

    let artifacts = warp::path!("v1" / "p2p" / "steps" / String / "artifacts")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_artifacts);

    let events = warp::path!("v1" / "p2p" / "sessions" / String / "events")
        .and(warp::get())
        .and(warp::query())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_events);

    let stream = warp::path!("v1" / "p2p" / "events" / "stream")
        .and(warp::get())
        .and(warp::query())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::stream_events);

    let raft_status = warp::path!("v1" / "p2p" / "raft")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::raft_status);

    let raft_join = warp::path!("v1" / "p2p" / "raft" / "join")
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::raft_join);

    let raft_leave = warp::path!("v1" / "p2p" / "raft" / "leave")
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::raft_leave);

    let stats = warp::path!("v1" / "p2p" / "stats")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::get_stats);

    let healthz = warp::path!("v1" / "p2p" / "healthz")
        .and(warp::get())
        .and_then(handlers::healthz)
        .or(warp::path!("healthz")
            .and(warp::get())
            .and_then(handlers::healthz));

    // Internal raft transport, large limit for snapshot chunks.
    let raft_rpc_limit = warp::body::content_length_limit(16 * 1024 * 1024);
    let append_entries = warp::path!("v1" / "raft" / "append-entries")
        .and(warp::post())
        .and(raft_rpc_limit)
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::raft_append_entries);
    let vote = warp::path!("v1" / "raft" / "vote")
        .and(warp::post())
        .and(raft_rpc_limit)
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handlers::raft_vote);
    let install_snapshot = warp::path!("v1" / "raft" / "install-snapshot")
        .and(warp::post())
        .and(raft_rpc_limit)
        .and(warp::body::json())
        .and(with_ctx(ctx))
        .and_then(handlers::raft_install_snapshot);

    tx.or(session)
        .or(participants)
        .or(open_steps)
        .or(step)
        .or(artifacts)
        .or(events)
        .or(stream)
        .or(raft_join)
        .or(raft_leave)
        .or(raft_status)
        .or(stats)
        .or(healthz)
        .or(append_entries)
        .or(vote)
        .or(install_snapshot)
        .recover(handlers::handle_rejection)
}

/// Binds the surface and serves it until the shutdown signal fires.
/// Returns the bound address (useful with port 0) and the join handle.
pub fn serve(
    ctx: Arc<ApiContext>,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let filter = routes(ctx);
    let (bound, server) = warp::serve(filter)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.await;
        })
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;
    info!(%bound, "http surface listening");
    Ok((bound, tokio::spawn(server)))
}
