//! Log command and response types carried through Raft.

use async_raft::{AppData, AppDataResponse, Raft};
use cohort_core::{Tx, TxReceipt};
use serde::{Deserialize, Serialize};

/// A signed transaction as a Raft log payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogCommand(pub Tx);

impl AppData for LogCommand {}

/// The apply receipt travelling back to the submitting client.
///
/// State machine rejections ride inside the receipt; an apply error would
/// take the whole Raft core down, which is reserved for storage faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogReceipt(pub TxReceipt);

impl AppDataResponse for LogReceipt {}

/// The concrete Raft over cohort's command, storage and transport types.
pub type CohortRaft =
    Raft<LogCommand, LogReceipt, crate::network::HttpRaftNetwork, crate::store::SledLogStore>;
