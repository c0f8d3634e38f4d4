//! Raft integration for cohort nodes.
//!
//! Wraps the `async-raft` engine with a sled-backed log store, an HTTP
//! transport resolved through a shared route table, and the
//! [`ConsensusNode`] facade the HTTP surface talks to.

pub mod command;
pub mod network;
pub mod node;
pub mod store;

pub use command::{CohortRaft, LogCommand, LogReceipt};
pub use network::{HttpRaftNetwork, RouteTable, RpcEnvelope};
pub use node::{ConsensusNode, JoinRequest, JoinResponse, PeerInfo, RaftStatus};
pub use store::SledLogStore;
