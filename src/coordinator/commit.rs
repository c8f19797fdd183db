//! Commit sequencing: per-store ordinal assignment and durable append.

use super::history::CommitHistory;
use crate::error::{HelmError, Result};
use crate::storage::TransactionStore;
use crate::types::{CommittedTransaction, Epoch, ResourceId, ResourceType, TxOrdinal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Transaction-extraction collaborator: produces the opaque serialized
/// change-set from a replica's in-flight transaction and names the
/// resources it implicates. The coordinator never interprets the payload,
/// only stores and forwards it.
pub trait ChangeExtractor {
  /// Resource ids the committing session must still hold write locks on.
  fn write_set(&self) -> Vec<(ResourceType, ResourceId)>;

  /// The serialized transaction payload.
  fn extract(&self) -> Result<Vec<u8>>;
}

/// Pre-staged change-set, for embedders and tests that already hold the
/// serialized payload.
#[derive(Debug, Clone)]
pub struct StagedChange {
  write_set: Vec<(ResourceType, ResourceId)>,
  payload: Vec<u8>,
}

impl StagedChange {
  pub fn new(write_set: Vec<(ResourceType, ResourceId)>, payload: Vec<u8>) -> Self {
    Self { write_set, payload }
  }
}

impl ChangeExtractor for StagedChange {
  fn write_set(&self) -> Vec<(ResourceType, ResourceId)> {
    self.write_set.clone()
  }

  fn extract(&self) -> Result<Vec<u8>> {
    Ok(self.payload.clone())
  }
}

#[derive(Debug, Default)]
struct StoreSequence {
  /// Last ordinal durably committed (0 = none).
  last: TxOrdinal,
}

/// The single serialization point for commits: one mutex per store around
/// ordinal assignment plus durable append, so two concurrent commits for a
/// store never interleave.
pub struct CommitSequencer {
  epoch: Epoch,
  sequences: Mutex<HashMap<String, Arc<Mutex<StoreSequence>>>>,
}

impl CommitSequencer {
  pub fn new(epoch: Epoch) -> Self {
    Self {
      epoch,
      sequences: Mutex::new(HashMap::new()),
    }
  }

  pub fn epoch(&self) -> Epoch {
    self.epoch
  }

  /// Assign the next ordinal for `store`, durably append, and publish to
  /// history. A failed append reports `CommitFailed` and does not consume
  /// the ordinal, keeping the sequence gap-free.
  pub fn commit(
    &self,
    store: &str,
    payload: &[u8],
    storage: &dyn TransactionStore,
    history: &CommitHistory,
  ) -> Result<TxOrdinal> {
    let sequence = self.sequence_for(store, storage)?;
    let mut sequence = sequence.lock();

    let ordinal = sequence.last + 1;
    storage
      .append(store, ordinal, self.epoch, payload)
      .map_err(|error| HelmError::CommitFailed(error.to_string()))?;
    sequence.last = ordinal;

    history.publish(CommittedTransaction {
      store: store.to_string(),
      ordinal,
      epoch: self.epoch,
      payload: payload.to_vec(),
    });
    Ok(ordinal)
  }

  /// Fetch or create a store's sequence, seeding it from the durable head
  /// so a new master continues where its predecessor stopped.
  fn sequence_for(
    &self,
    store: &str,
    storage: &dyn TransactionStore,
  ) -> Result<Arc<Mutex<StoreSequence>>> {
    let mut sequences = self.sequences.lock();
    if let Some(sequence) = sequences.get(store) {
      return Ok(sequence.clone());
    }

    let last = storage.head(store)?.unwrap_or(0);
    let sequence = Arc::new(Mutex::new(StoreSequence { last }));
    sequences.insert(store.to_string(), sequence.clone());
    Ok(sequence)
  }

  /// Forget every sequence. Used on master retirement.
  pub fn clear(&self) {
    self.sequences.lock().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::{CommitHistory, CommitSequencer};
  use crate::error::HelmError;
  use crate::storage::{MemoryStore, TransactionStore};

  #[test]
  fn ordinals_start_at_one_and_advance() {
    let storage = MemoryStore::new();
    let history = CommitHistory::new(64);
    let sequencer = CommitSequencer::new(1);

    assert_eq!(
      sequencer.commit("graph.store", b"a", &storage, &history).expect("first"),
      1
    );
    assert_eq!(
      sequencer.commit("graph.store", b"b", &storage, &history).expect("second"),
      2
    );
    assert_eq!(
      sequencer.commit("index.store", b"c", &storage, &history).expect("other store"),
      1
    );
    assert_eq!(history.head("graph.store"), 2);
  }

  #[test]
  fn failed_append_does_not_consume_the_ordinal() {
    let storage = MemoryStore::new();
    let history = CommitHistory::new(64);
    let sequencer = CommitSequencer::new(1);

    sequencer.commit("graph.store", b"a", &storage, &history).expect("seed");

    storage.fail_appends(true);
    let err = sequencer
      .commit("graph.store", b"lost", &storage, &history)
      .unwrap_err();
    assert!(matches!(err, HelmError::CommitFailed(_)));
    assert_eq!(history.head("graph.store"), 1);

    storage.fail_appends(false);
    assert_eq!(
      sequencer.commit("graph.store", b"b", &storage, &history).expect("retry"),
      2
    );
    assert_eq!(storage.head("graph.store").expect("head"), Some(2));
  }

  #[test]
  fn sequence_seeds_from_durable_head() {
    let storage = MemoryStore::new();
    let history = CommitHistory::new(64);

    let first = CommitSequencer::new(1);
    for payload in [b"a", b"b", b"c"] {
      first.commit("graph.store", payload, &storage, &history).expect("commit");
    }

    let successor = CommitSequencer::new(2);
    let ordinal = successor
      .commit("graph.store", b"d", &storage, &CommitHistory::new(64))
      .expect("continue");
    assert_eq!(ordinal, 4);
  }
}
