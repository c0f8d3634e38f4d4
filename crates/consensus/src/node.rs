//! The consensus node facade.
//!
//! Everything the HTTP surface needs: transaction submission with leader
//! hints, membership changes, leader discovery and the startup join loop.

use crate::command::{CohortRaft, LogCommand, LogReceipt};
use crate::network::{HttpRaftNetwork, RouteTable, RpcEnvelope};
use crate::store::SledLogStore;
use anyhow::{bail, Context, Result};
use async_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use async_raft::error::{ClientWriteError, RaftError};
use async_raft::metrics::RaftMetrics;
use async_raft::{Config, NodeId, Raft, SnapshotPolicy, State};
use cohort_config::NodeConfig;
use cohort_core::{CoreError, Tx, TxReceipt};
use cohort_crypto::TxVerifier;
use cohort_events::EventHub;
use cohort_state::SharedState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Membership cap shared by `AddVoter` and `RemoveServer`.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `POST /v1/p2p/raft/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: String,
    #[serde(default)]
    pub raft_id: Option<NodeId>,
    pub raft_addr: String,
}

/// Join response: the joiner learns the whole route table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: String,
    pub raft_id: NodeId,
    pub routes: BTreeMap<NodeId, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: Option<String>,
    pub voter: bool,
}

/// Shape of `GET /v1/p2p/raft`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    pub node_id: String,
    pub raft_id: NodeId,
    pub state: String,
    pub term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub peers: Vec<PeerInfo>,
}

pub struct ConsensusNode {
    raft: CohortRaft,
    raft_id: NodeId,
    node_id: String,
    advertise: String,
    routes: Arc<RouteTable>,
    store: Arc<SledLogStore>,
    apply_timeout: Duration,
}

impl ConsensusNode {
    /// Opens the stores, restores state and spawns the Raft core. Must run
    /// inside a tokio runtime.
    pub fn new(
        config: &NodeConfig,
        state: SharedState,
        verifier: Arc<dyn TxVerifier>,
        hub: Arc<EventHub>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

        let raft_id = config.raft_id();
        let advertise = config.advertise_url();

        let log_path = config.raft_log_path();
        let log = sled::open(&log_path)
            .with_context(|| format!("open raft log store {}", log_path.display()))?;
        let stable_path = config.raft_stable_path();
        let stable = sled::open(&stable_path)
            .with_context(|| format!("open raft stable store {}", stable_path.display()))?;

        let store = Arc::new(SledLogStore::open(
            raft_id,
            log,
            stable.clone(),
            &config.snapshots_dir(),
            config.snapshot_retain,
            state,
            verifier,
            hub,
        )?);

        // The route table shares the stable store so a restarted node can
        // still reach its peers.
        let routes = Arc::new(RouteTable::with_store(stable));
        routes.upsert(raft_id, advertise.clone());

        let network = Arc::new(HttpRaftNetwork::new(
            routes.clone(),
            raft_id,
            advertise.clone(),
        ));

        let raft_config = Config::build("cohort".into())
            .election_timeout_min(1500)
            .election_timeout_max(3000)
            .heartbeat_interval(300)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(5000))
            .validate()
            .context("raft config")?;
        let raft: CohortRaft = Raft::new(raft_id, Arc::new(raft_config), network, store.clone());

        info!(node_id = %config.node_id, raft_id, advertise = %advertise, "consensus node ready");
        Ok(Arc::new(Self {
            raft,
            raft_id,
            node_id: config.node_id.clone(),
            advertise,
            routes,
            store,
            apply_timeout: config.apply_timeout,
        }))
    }

    pub fn raft_id(&self) -> NodeId {
        self.raft_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.clone()
    }

    pub fn store(&self) -> Arc<SledLogStore> {
        self.store.clone()
    }

    /// Single-voter bootstrap, only when configured and the stores are
    /// pristine.
    pub async fn bootstrap_if_needed(&self, bootstrap: bool) -> Result<bool> {
        if !bootstrap {
            return Ok(false);
        }
        if !self.store.is_pristine()? {
            info!("existing raft state found, skipping bootstrap");
            return Ok(false);
        }
        let mut members = HashSet::new();
        members.insert(self.raft_id);
        self.raft
            .initialize(members)
            .await
            .context("bootstrap initialize")?;
        info!(raft_id = self.raft_id, "bootstrapped single-node cluster");
        Ok(true)
    }

    /// Submits a signed transaction to the replicated log and waits for the
    /// apply receipt, honoring the caller's deadline.
    pub async fn submit(&self, tx: Tx, deadline: Option<Duration>) -> Result<TxReceipt, CoreError> {
        let timeout = deadline.unwrap_or(self.apply_timeout).min(self.apply_timeout);
        let write = self.raft.client_write(ClientWriteRequest::new(LogCommand(tx)));
        match tokio::time::timeout(timeout, write).await {
            Err(_) => Err(CoreError::DeadlineExceeded(
                "transaction did not commit before the deadline".into(),
            )),
            Ok(Ok(response)) => {
                let LogReceipt(receipt) = response.data;
                Ok(receipt)
            }
            Ok(Err(ClientWriteError::ForwardToLeader(_, leader))) => Err(CoreError::NotLeader {
                leader: leader.and_then(|id| self.routes.get(id)),
            }),
            Ok(Err(ClientWriteError::RaftError(err))) => Err(map_raft_error(err)),
        }
    }

    // Raft RPC handlers: learn the sender's route, then delegate.

    pub async fn handle_append_entries(
        &self,
        envelope: RpcEnvelope<AppendEntriesRequest<LogCommand>>,
    ) -> Result<AppendEntriesResponse> {
        self.routes.upsert(envelope.from_id, envelope.from_addr);
        Ok(self.raft.append_entries(envelope.body).await?)
    }

    pub async fn handle_vote(&self, envelope: RpcEnvelope<VoteRequest>) -> Result<VoteResponse> {
        self.routes.upsert(envelope.from_id, envelope.from_addr);
        Ok(self.raft.vote(envelope.body).await?)
    }

    pub async fn handle_install_snapshot(
        &self,
        envelope: RpcEnvelope<InstallSnapshotRequest>,
    ) -> Result<InstallSnapshotResponse> {
        self.routes.upsert(envelope.from_id, envelope.from_addr);
        Ok(self.raft.install_snapshot(envelope.body).await?)
    }

    /// Adds a voter: any colliding registration is replaced by the new
    /// address, the node is caught up as a non-voter, then membership
    /// changes. Leader only; both phases respect the 10 s cap.
    pub async fn add_voter(&self, raft_id: NodeId, addr: &str) -> Result<(), CoreError> {
        self.routes.upsert(raft_id, addr);
        let metrics = self.metrics();
        if metrics.membership_config.members.contains(&raft_id) {
            info!(raft_id, "node already a voter, refreshed its route");
            return Ok(());
        }

        let catch_up = tokio::time::timeout(MEMBERSHIP_TIMEOUT, self.raft.add_non_voter(raft_id));
        match catch_up.await {
            Err(_) => {
                return Err(CoreError::DeadlineExceeded(
                    "non-voter sync did not finish in time".into(),
                ))
            }
            Ok(Err(err)) => return Err(CoreError::Internal(format!("add_non_voter: {err}"))),
            Ok(Ok(())) => {}
        }

        let mut members = self.metrics().membership_config.members;
        members.insert(raft_id);
        let change = tokio::time::timeout(MEMBERSHIP_TIMEOUT, self.raft.change_membership(members));
        match change.await {
            Err(_) => Err(CoreError::DeadlineExceeded(
                "membership change did not commit in time".into(),
            )),
            Ok(Err(err)) => Err(CoreError::Internal(format!("change_membership: {err}"))),
            Ok(Ok(())) => {
                info!(raft_id, addr, "voter added");
                Ok(())
            }
        }
    }

    /// Removes a server from the voting membership by id.
    pub async fn remove_server(&self, raft_id: NodeId) -> Result<(), CoreError> {
        let mut members = self.metrics().membership_config.members;
        if !members.remove(&raft_id) {
            return Err(CoreError::NotFound(format!(
                "node {raft_id} is not a cluster member"
            )));
        }
        let change = tokio::time::timeout(MEMBERSHIP_TIMEOUT, self.raft.change_membership(members));
        match change.await {
            Err(_) => Err(CoreError::DeadlineExceeded(
                "membership change did not commit in time".into(),
            )),
            Ok(Err(err)) => Err(CoreError::Internal(format!("change_membership: {err}"))),
            Ok(Ok(())) => {
                self.routes.remove(raft_id);
                info!(raft_id, "server removed");
                Ok(())
            }
        }
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.metrics().state == State::Leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.metrics().current_leader
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.leader_id().and_then(|id| self.routes.get(id))
    }

    /// Blocks until any leader is observable or the timeout lapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.raft.metrics();
        loop {
            if let Some(leader) = rx.borrow().current_leader {
                return Some(leader);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return rx.borrow().current_leader,
            }
        }
    }

    pub fn status(&self) -> RaftStatus {
        let metrics = self.metrics();
        let routes = self.routes.all();
        let mut all_ids: Vec<NodeId> = metrics.membership_config.members.iter().copied().collect();
        if let Some(next) = &metrics.membership_config.members_after_consensus {
            for id in next {
                if !all_ids.contains(id) {
                    all_ids.push(*id);
                }
            }
        }
        all_ids.sort_unstable();
        let peers = all_ids
            .into_iter()
            .map(|id| PeerInfo {
                id,
                addr: routes.get(&id).cloned(),
                voter: metrics.membership_config.members.contains(&id),
            })
            .collect();
        RaftStatus {
            node_id: self.node_id.clone(),
            raft_id: self.raft_id,
            state: format!("{:?}", metrics.state),
            term: metrics.current_term,
            last_log_index: metrics.last_log_index,
            last_applied: metrics.last_applied,
            leader_id: metrics.current_leader,
            leader_addr: self.leader_addr(),
            peers,
        }
    }

    /// Startup join loop: asks an existing cluster to add this node,
    /// retrying until accepted or retries are exhausted.
    pub async fn join_cluster(
        &self,
        endpoint: &str,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<()> {
        let client = reqwest::Client::new();
        let body = JoinRequest {
            node_id: self.node_id.clone(),
            raft_id: Some(self.raft_id),
            raft_addr: self.advertise.clone(),
        };
        let url = format!("{}/v1/p2p/raft/join", endpoint.trim_end_matches('/'));
        for attempt in 1..=retries.max(1) {
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(join) = response.json::<JoinResponse>().await {
                        self.routes.merge(&join.routes);
                    }
                    info!(endpoint, attempt, "joined cluster");
                    return Ok(());
                }
                Ok(response) => {
                    // Follower answered: chase the leader hint when present.
                    let status = response.status();
                    let hint = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v["leader"].as_str().map(str::to_string));
                    warn!(endpoint, attempt, %status, ?hint, "join attempt refused");
                    if let Some(leader) = hint {
                        let leader_url =
                            format!("{}/v1/p2p/raft/join", leader.trim_end_matches('/'));
                        if let Ok(retry) = client.post(&leader_url).json(&body).send().await {
                            if retry.status().is_success() {
                                if let Ok(join) = retry.json::<JoinResponse>().await {
                                    self.routes.merge(&join.routes);
                                }
                                info!(leader = %leader, attempt, "joined cluster via leader hint");
                                return Ok(());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(endpoint, attempt, error = %err, "join attempt failed");
                }
            }
            tokio::time::sleep(retry_delay).await;
        }
        bail!("join exhausted after {retries} attempts against {endpoint}")
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.raft.shutdown().await {
            warn!(error = %err, "raft shutdown reported an error");
        }
    }
}

fn map_raft_error(err: RaftError) -> CoreError {
    CoreError::Internal(format!("raft: {err}"))
}
