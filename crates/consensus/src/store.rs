//! Sled-backed Raft storage.
//!
//! The log and hard state live in two sled databases under the node's data
//! directory; snapshots are JSON files under `snapshots/` with a bounded
//! retention. The applied state machine itself stays in memory (it is
//! rebuilt from the newest snapshot plus committed log replay on restart).

use crate::command::{LogCommand, LogReceipt};
use anyhow::{Context, Result};
use async_raft::raft::{Entry, EntryPayload, MembershipConfig};
use async_raft::storage::{CurrentSnapshotData, HardState, InitialState};
use async_raft::{NodeId, RaftStorage};
use async_trait::async_trait;
use cohort_events::EventHub;
use cohort_state::{CollabState, SharedState};
use cohort_crypto::TxVerifier;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const HARD_STATE_KEY: &[u8] = b"hard-state";

/// Full snapshot blob as streamed between nodes and stored on disk.
#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    index: u64,
    term: u64,
    membership: MembershipConfig,
    state: CollabState,
}

/// Errors from `apply_entry_to_state_machine` that must stop the node.
/// Business rejections never use this; they ride inside the receipt.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("storage fault: {0}")]
    Storage(String),
}

pub struct SledLogStore {
    id: NodeId,
    log: sled::Db,
    stable: sled::Db,
    snapshots_dir: PathBuf,
    retain: usize,
    state: SharedState,
    verifier: Arc<dyn TxVerifier>,
    hub: Arc<EventHub>,
    last_applied: AtomicU64,
}

fn idx_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn decode_entry(bytes: &[u8]) -> Result<Entry<LogCommand>> {
    serde_json::from_slice(bytes).context("log entry decode")
}

impl SledLogStore {
    /// Wraps already-opened stores and restores the state machine from the
    /// newest snapshot, if one exists.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        id: NodeId,
        log: sled::Db,
        stable: sled::Db,
        snapshots_dir: &Path,
        retain: usize,
        state: SharedState,
        verifier: Arc<dyn TxVerifier>,
        hub: Arc<EventHub>,
    ) -> Result<Self> {
        std::fs::create_dir_all(snapshots_dir)
            .with_context(|| format!("create {}", snapshots_dir.display()))?;

        let store = Self {
            id,
            log,
            stable,
            snapshots_dir: snapshots_dir.to_path_buf(),
            retain: retain.max(1),
            state,
            verifier,
            hub,
            last_applied: AtomicU64::new(0),
        };

        if let Some((path, blob)) = store.newest_snapshot_blob()? {
            info!(
                snapshot = %path.display(),
                index = blob.index,
                "restoring state machine from snapshot"
            );
            let mut restored = blob.state;
            restored.rebuild_indexes();
            *store.state.write() = restored;
            store.last_applied.store(blob.index, Ordering::SeqCst);
        }
        Ok(store)
    }

    /// True when no hard state, log entries or snapshots exist: the
    /// condition for a single-node bootstrap.
    pub fn is_pristine(&self) -> Result<bool> {
        let has_hard_state = self.stable.get(HARD_STATE_KEY)?.is_some();
        let has_log = self.log.first()?.is_some();
        let has_snapshot = self.newest_snapshot_path()?.is_some();
        Ok(!has_hard_state && !has_log && !has_snapshot)
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    fn snapshot_file(&self, term: u64, index: u64, id: &str) -> PathBuf {
        // Zero-padded so lexicographic order is chronological order.
        self.snapshots_dir
            .join(format!("{term:020}-{index:020}-{id}.snap"))
    }

    fn snapshot_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.snapshots_dir)
            .with_context(|| format!("read {}", self.snapshots_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "snap").unwrap_or(false))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn newest_snapshot_path(&self) -> Result<Option<PathBuf>> {
        Ok(self.snapshot_paths()?.into_iter().last())
    }

    fn newest_snapshot_blob(&self) -> Result<Option<(PathBuf, SnapshotBlob)>> {
        match self.newest_snapshot_path()? {
            Some(path) => {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("read snapshot {}", path.display()))?;
                let blob: SnapshotBlob = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decode snapshot {}", path.display()))?;
                Ok(Some((path, blob)))
            }
            None => Ok(None),
        }
    }

    fn write_snapshot_file(&self, blob_bytes: &[u8], term: u64, index: u64, id: &str) -> Result<()> {
        let path = self.snapshot_file(term, index, id);
        std::fs::write(&path, blob_bytes)
            .with_context(|| format!("write snapshot {}", path.display()))?;
        self.prune_snapshots()?;
        Ok(())
    }

    fn prune_snapshots(&self) -> Result<()> {
        let paths = self.snapshot_paths()?;
        if paths.len() > self.retain {
            for stale in &paths[..paths.len() - self.retain] {
                if let Err(err) = std::fs::remove_file(stale) {
                    warn!(path = %stale.display(), error = %err, "failed to prune snapshot");
                }
            }
        }
        Ok(())
    }

    fn apply_one(&self, index: u64, command: &LogCommand) -> LogReceipt {
        let outcome = {
            let mut state = self.state.write();
            state.apply_tx(&command.0, self.verifier.as_ref())
        };
        self.hub.publish_all(&outcome.events);
        self.last_applied.store(index, Ordering::SeqCst);
        LogReceipt(outcome.receipt)
    }

}

#[async_trait]
impl RaftStorage<LogCommand, LogReceipt> for SledLogStore {
    type Snapshot = Cursor<Vec<u8>>;
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> Result<MembershipConfig> {
        for item in self.log.iter().rev() {
            let (_, value) = item?;
            let entry = decode_entry(&value)?;
            match entry.payload {
                EntryPayload::ConfigChange(config) => return Ok(config.membership),
                EntryPayload::SnapshotPointer(pointer) => return Ok(pointer.membership),
                _ => continue,
            }
        }
        if let Some((_, blob)) = self.newest_snapshot_blob()? {
            return Ok(blob.membership);
        }
        Ok(MembershipConfig::new_initial(self.id))
    }

    async fn get_initial_state(&self) -> Result<InitialState> {
        let hard_state: Option<HardState> = self
            .stable
            .get(HARD_STATE_KEY)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .context("hard state decode")?;
        match hard_state {
            Some(hard_state) => {
                let membership = self.get_membership_config().await?;
                let (last_log_index, last_log_term) = match self.log.last()? {
                    Some((_, value)) => {
                        let entry = decode_entry(&value)?;
                        (entry.index, entry.term)
                    }
                    None => (0, 0),
                };
                Ok(InitialState {
                    last_log_index,
                    last_log_term,
                    last_applied_log: self.last_applied.load(Ordering::SeqCst),
                    hard_state,
                    membership,
                })
            }
            None => {
                // No write here: the pristine check that gates bootstrap
                // must keep seeing an untouched store.
                Ok(InitialState::new_initial(self.id))
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        self.stable
            .insert(HARD_STATE_KEY, serde_json::to_vec(hs)?)?;
        self.stable.flush_async().await?;
        Ok(())
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<LogCommand>>> {
        if start >= stop {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for item in self.log.range(idx_key(start)..idx_key(stop)) {
            let (_, value) = item?;
            entries.push(decode_entry(&value)?);
        }
        Ok(entries)
    }

    async fn delete_logs_from(&self, start: u64, stop: Option<u64>) -> Result<()> {
        let keys: Vec<sled::IVec> = match stop {
            Some(stop) => self
                .log
                .range(idx_key(start)..idx_key(stop))
                .keys()
                .collect::<std::result::Result<_, _>>()?,
            None => self
                .log
                .range(idx_key(start)..)
                .keys()
                .collect::<std::result::Result<_, _>>()?,
        };
        for key in keys {
            self.log.remove(key)?;
        }
        self.log.flush_async().await?;
        Ok(())
    }

    async fn append_entry_to_log(&self, entry: &Entry<LogCommand>) -> Result<()> {
        self.log
            .insert(idx_key(entry.index), serde_json::to_vec(entry)?)?;
        self.log.flush_async().await?;
        Ok(())
    }

    async fn replicate_to_log(&self, entries: &[Entry<LogCommand>]) -> Result<()> {
        for entry in entries {
            self.log
                .insert(idx_key(entry.index), serde_json::to_vec(entry)?)?;
        }
        self.log.flush_async().await?;
        Ok(())
    }

    async fn apply_entry_to_state_machine(
        &self,
        index: &u64,
        data: &LogCommand,
    ) -> Result<LogReceipt> {
        Ok(self.apply_one(*index, data))
    }

    async fn replicate_to_state_machine(&self, entries: &[(&u64, &LogCommand)]) -> Result<()> {
        for (index, command) in entries {
            self.apply_one(**index, command);
        }
        Ok(())
    }

    async fn do_log_compaction(&self) -> Result<CurrentSnapshotData<Self::Snapshot>> {
        let last_applied = self.last_applied.load(Ordering::SeqCst);
        let membership = self.get_membership_config().await?;
        let term = match self.log.get(idx_key(last_applied))? {
            Some(value) => decode_entry(&value)?.term,
            None => 0,
        };
        let state = self.state.read().clone();
        let blob = SnapshotBlob {
            index: last_applied,
            term,
            membership: membership.clone(),
            state,
        };
        let bytes = serde_json::to_vec(&blob)?;
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        self.write_snapshot_file(&bytes, term, last_applied, &snapshot_id)?;

        // Compact: drop everything the snapshot covers and leave a pointer.
        self.delete_logs_from(0, Some(last_applied + 1)).await?;
        let pointer = Entry::<LogCommand>::new_snapshot_pointer(
            last_applied,
            term,
            snapshot_id.clone(),
            membership.clone(),
        );
        self.log
            .insert(idx_key(last_applied), serde_json::to_vec(&pointer)?)?;
        self.log.flush_async().await?;

        info!(index = last_applied, term, "log compacted into snapshot");
        Ok(CurrentSnapshotData {
            term,
            index: last_applied,
            membership,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }

    async fn create_snapshot(&self) -> Result<(String, Box<Self::Snapshot>)> {
        Ok((
            uuid::Uuid::new_v4().to_string(),
            Box::new(Cursor::new(Vec::new())),
        ))
    }

    async fn finalize_snapshot_installation(
        &self,
        index: u64,
        term: u64,
        delete_through: Option<u64>,
        id: String,
        snapshot: Box<Self::Snapshot>,
    ) -> Result<()> {
        let bytes = snapshot.into_inner();
        let blob: SnapshotBlob =
            serde_json::from_slice(&bytes).context("streamed snapshot decode")?;

        let mut restored = blob.state;
        restored.rebuild_indexes();
        *self.state.write() = restored;
        self.last_applied.store(index, Ordering::SeqCst);

        match delete_through {
            Some(through) => self.delete_logs_from(0, Some(through + 1)).await?,
            None => self.delete_logs_from(0, None).await?,
        }
        let pointer = Entry::<LogCommand>::new_snapshot_pointer(
            index,
            term,
            id.clone(),
            blob.membership.clone(),
        );
        self.log
            .insert(idx_key(index), serde_json::to_vec(&pointer)?)?;
        self.log.flush_async().await?;

        let file_blob = SnapshotBlob {
            index,
            term,
            membership: blob.membership,
            state: self.state.read().clone(),
        };
        self.write_snapshot_file(&serde_json::to_vec(&file_blob)?, term, index, &id)?;
        info!(index, term, "snapshot installed from leader");
        Ok(())
    }

    async fn get_current_snapshot(&self) -> Result<Option<CurrentSnapshotData<Self::Snapshot>>> {
        match self.newest_snapshot_blob()? {
            Some((_, blob)) => {
                let bytes = serde_json::to_vec(&blob)?;
                Ok(Some(CurrentSnapshotData {
                    term: blob.term,
                    index: blob.index,
                    membership: blob.membership.clone(),
                    snapshot: Box::new(Cursor::new(bytes)),
                }))
            }
            None => Ok(None),
        }
    }
}

