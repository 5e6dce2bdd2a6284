//! CRDT document handle — the integration boundary around `yrs`.
//!
//! The room never looks inside a delta: it applies opaque binary updates,
//! encodes full state for new joiners, and reads a logical clock for
//! observability. Merge semantics (idempotent, commutative, duplicate
//! tolerant) are a `yrs` guarantee, not re-verified here.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Errors surfaced by the document boundary.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Update bytes did not decode as a v1 lib0 update.
    Decode(String),
    /// Decoded update failed to merge.
    Apply(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::Decode(e) => write!(f, "Update decode error: {e}"),
            DocError::Apply(e) => write!(f, "Update apply error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// Owned wrapper around the authoritative `yrs::Doc` of one room.
pub struct DocHandle {
    doc: Doc,
}

impl DocHandle {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Merge a binary delta into the document.
    ///
    /// Out-of-order and duplicate deltas are safe; a delta that fails to
    /// decode or apply leaves the document untouched.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(update).map_err(|e| DocError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Encode the full document state as a single delta.
    ///
    /// Applied to an empty document, the result reconstructs current state —
    /// used to bootstrap newly joined connections and for snapshots.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Monotonically increasing logical clock: the sum of all per-client
    /// clocks in the state vector. Only ever grows as updates merge.
    pub fn logical_clock(&self) -> u64 {
        let txn = self.doc.transact();
        txn.state_vector().iter().map(|(_, clock)| *clock as u64).sum()
    }

    /// Access the underlying doc (tests and benchmarks only need this).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for DocHandle {
    fn default() -> Self {
        Self::new()
    }
}
