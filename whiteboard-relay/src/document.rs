//! Replicated document: one authoritative Yrs replica per room.
//!
//! The relay only needs the summary/diff/merge surface. Record helpers
//! (`set_record`, `remove_record`, `records`) exist for local mutation by
//! the client provider and for tests; the relay never calls them and never
//! looks inside update payloads.
//!
//! Merge is delegated to Yrs, which is commutative, associative and
//! idempotent over v1 updates. Updates whose dependencies have not arrived
//! yet are parked by Yrs and integrated once the missing blocks show up.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::BTreeMap;

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Subscription, Transact, Update};

/// Root map holding shape/record values keyed by record id.
pub const RECORD_MAP: &str = "tldraw";

/// A v1 update with no blocks and no deletions.
pub const EMPTY_UPDATE: &[u8] = &[0, 0];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("invalid state summary: {0}")]
    InvalidSummary(String),
    #[error("invalid update payload: {0}")]
    InvalidUpdate(String),
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("failed to register update observer: {0}")]
    Subscribe(String),
}

/// In-memory CRDT replica.
pub struct Replica {
    doc: Doc,
    records: MapRef,
}

impl Replica {
    pub fn new() -> Self {
        let doc = Doc::new();
        let records = doc.get_or_insert_map(RECORD_MAP);
        Self { doc, records }
    }

    /// Yrs client id used for local mutations.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// What this replica has seen so far.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encoded state vector.
    pub fn state_summary(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Update the remote side needs to converge, given its state vector.
    pub fn diff_state_vector(&self, remote_sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(remote_sv)
    }

    /// Same as [`Replica::diff_state_vector`], from an encoded summary.
    pub fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote_sv = StateVector::decode_v1(remote_summary)
            .map_err(|e| ReplicaError::InvalidSummary(e.to_string()))?;
        Ok(self.diff_state_vector(&remote_sv))
    }

    /// Full state as a single update, as seen by an empty replica.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a remote update.
    ///
    /// Returns the normalized update covering everything this merge
    /// integrated, or `None` when nothing new became visible (duplicate
    /// delivery, or blocks still waiting on missing dependencies).
    pub fn merge(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Rejected(e.to_string()))?;
        let applied = txn.encode_update_v1();
        Ok(if is_empty_update(&applied) { None } else { Some(applied) })
    }

    /// Observe every committed change, local or merged.
    ///
    /// The callback receives the v1 update of the committed transaction and
    /// runs synchronously inside the commit. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe<F>(&self, on_change: F) -> Result<Subscription, ReplicaError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| on_change(&event.update))
            .map_err(|e| ReplicaError::Subscribe(format!("{e:?}")))
    }

    /// Write a serialized record value; returns the update to broadcast.
    pub fn set_record(&mut self, id: &str, value: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.records.insert(&mut txn, id, value.to_string());
        txn.encode_update_v1()
    }

    /// Delete a record; returns the update to broadcast, if it existed.
    pub fn remove_record(&mut self, id: &str) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        self.records.remove(&mut txn, id)?;
        Some(txn.encode_update_v1())
    }

    /// Value of one record as a string.
    pub fn record(&self, id: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.records.get(&txn, id).map(|value| out_to_string(value, &txn))
    }

    /// Snapshot of the record mapping, ordered by id.
    pub fn records(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        self.records
            .iter(&txn)
            .map(|(key, value)| (key.to_string(), out_to_string(value, &txn)))
            .collect()
    }

    pub fn record_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.records.len(&txn)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a v1 update carries no blocks and no deletions.
pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE
}

fn out_to_string<T: ReadTxn>(value: Out, txn: &T) -> String {
    match value {
        Out::Any(Any::String(s)) => s.to_string(),
        other => other.to_string(txn),
    }
}
