//! Cohort: leaderless multi-party workflow orchestration.
//!
//! A cluster of cohort nodes cooperatively executes a DAG of workflow steps:
//! every mutation is a signed transaction replicated through Raft and applied
//! by a deterministic state machine on each replica. This facade crate
//! re-exports the workspace crates under one roof.

pub use cohort_config as config;
pub use cohort_consensus as consensus;
pub use cohort_core as core;
pub use cohort_crypto as crypto;
pub use cohort_events as events;
pub use cohort_rpc_server as rpc_server;
pub use cohort_state as state;

/// Workspace version, stamped into `/v1/p2p/raft` responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
