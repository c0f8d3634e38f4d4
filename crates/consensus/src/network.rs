//! HTTP Raft transport.
//!
//! Raft RPCs ride the peer's HTTP server under `/v1/raft/*`. Targets are
//! resolved through the [`RouteTable`]; every request carries the sender's
//! identity so receivers learn routes passively, and join responses merge
//! the leader's full table.

use crate::command::LogCommand;
use anyhow::{anyhow, Context, Result};
use async_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use async_raft::{NodeId, RaftNetwork};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const ROUTES_KEY: &[u8] = b"routes";

/// Wraps a Raft RPC with the sender's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope<T> {
    pub from_id: NodeId,
    pub from_addr: String,
    pub body: T,
}

/// Node id to HTTP base address map, persisted into the stable store so a
/// restarted node can still find its peers.
pub struct RouteTable {
    routes: RwLock<BTreeMap<NodeId, String>>,
    stable: Option<sled::Db>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
            stable: None,
        }
    }

    /// A table backed by the stable store; previously persisted routes are
    /// loaded eagerly.
    pub fn with_store(stable: sled::Db) -> Self {
        let routes = stable
            .get(ROUTES_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            routes: RwLock::new(routes),
            stable: Some(stable),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<String> {
        self.routes.read().get(&id).cloned()
    }

    pub fn upsert(&self, id: NodeId, addr: impl Into<String>) {
        let addr = addr.into();
        let mut routes = self.routes.write();
        if routes.get(&id) == Some(&addr) {
            return;
        }
        debug!(node = id, addr = %addr, "route learned");
        routes.insert(id, addr);
        self.persist(&routes);
    }

    pub fn merge(&self, incoming: &BTreeMap<NodeId, String>) {
        let mut routes = self.routes.write();
        let mut changed = false;
        for (id, addr) in incoming {
            if routes.get(id) != Some(addr) {
                routes.insert(*id, addr.clone());
                changed = true;
            }
        }
        if changed {
            self.persist(&routes);
        }
    }

    pub fn remove(&self, id: NodeId) {
        let mut routes = self.routes.write();
        if routes.remove(&id).is_some() {
            self.persist(&routes);
        }
    }

    pub fn all(&self) -> BTreeMap<NodeId, String> {
        self.routes.read().clone()
    }

    fn persist(&self, routes: &BTreeMap<NodeId, String>) {
        if let Some(stable) = &self.stable {
            match serde_json::to_vec(routes) {
                Ok(bytes) => {
                    if let Err(err) = stable.insert(ROUTES_KEY, bytes) {
                        warn!(error = %err, "failed to persist route table");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode route table"),
            }
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `RaftNetwork` over plain HTTP POSTs.
pub struct HttpRaftNetwork {
    client: reqwest::Client,
    routes: std::sync::Arc<RouteTable>,
    from_id: NodeId,
    from_addr: String,
}

impl HttpRaftNetwork {
    pub fn new(routes: std::sync::Arc<RouteTable>, from_id: NodeId, from_addr: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            routes,
            from_id,
            from_addr,
        }
    }

    async fn post<Req, Resp>(&self, target: NodeId, path: &str, rpc: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let addr = self
            .routes
            .get(target)
            .ok_or_else(|| anyhow!("no route to node {target}"))?;
        let envelope = RpcEnvelope {
            from_id: self.from_id,
            from_addr: self.from_addr.clone(),
            body: rpc,
        };
        let response = self
            .client
            .post(format!("{addr}/v1/raft/{path}"))
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("raft rpc {path} to node {target} at {addr}"))?
            .error_for_status()
            .with_context(|| format!("raft rpc {path} to node {target}"))?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RaftNetwork<LogCommand> for HttpRaftNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<LogCommand>,
    ) -> Result<AppendEntriesResponse> {
        self.post(target, "append-entries", &rpc).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post(target, "install-snapshot", &rpc).await
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.post(target, "vote", &rpc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_table_round_trips_through_sled() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("stable")).unwrap();

        let table = RouteTable::with_store(db.clone());
        table.upsert(1, "http://127.0.0.1:18080");
        table.upsert(2, "http://127.0.0.1:18081");
        table.remove(1);

        let reloaded = RouteTable::with_store(db);
        assert_eq!(reloaded.get(2).as_deref(), Some("http://127.0.0.1:18081"));
        assert_eq!(reloaded.get(1), None);
    }

    #[test]
    fn merge_only_adds_and_updates() {
        let table = RouteTable::new();
        table.upsert(1, "http://a");
        let mut incoming = BTreeMap::new();
        incoming.insert(1, "http://a2".to_string());
        incoming.insert(3, "http://c".to_string());
        table.merge(&incoming);
        assert_eq!(table.get(1).as_deref(), Some("http://a2"));
        assert_eq!(table.get(3).as_deref(), Some("http://c"));
        assert_eq!(table.all().len(), 2);
    }
}
