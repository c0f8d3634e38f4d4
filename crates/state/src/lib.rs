//! The deterministic collaboration state machine.
//!
//! A [`CollabState`] owns every domain entity and is mutated exclusively by
//! [`CollabState::apply_tx`], which the consensus layer drives in committed
//! log order. Apply never reads the wall clock, never iterates a map in
//! nondeterministic order and never draws randomness; two replicas fed the
//! same transaction sequence produce byte-identical snapshots.

mod apply;
mod query;
mod state;

pub use query::{PageParams, Stats};
pub use state::{CollabState, SharedState, TxOutcome};

use parking_lot::RwLock;
use std::sync::Arc;

/// A state handle shared between the consensus apply path (write lock) and
/// the query surface (read lock).
pub fn shared(state: CollabState) -> SharedState {
    Arc::new(RwLock::new(state))
}
