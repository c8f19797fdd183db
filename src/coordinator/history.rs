//! Bounded committed-transaction history and catch-up stream computation.

use crate::error::{HelmError, Result};
use crate::types::{CommitProof, CommittedTransaction, TxOrdinal};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct StoreHistory {
  entries: VecDeque<CommittedTransaction>,
  /// Highest ordinal ever published (0 = none yet).
  head: TxOrdinal,
  /// Ordinal of the oldest retained entry; `head + 1` when nothing is
  /// retained. Only ever rises.
  retained_floor: TxOrdinal,
}

/// Recent commit history per store, truncated to a retention bound. A
/// caller whose watermark has fallen below the retained floor gets
/// `UpdateGapTooLarge` rather than a silently incomplete stream.
pub struct CommitHistory {
  retention: usize,
  stores: Mutex<HashMap<String, StoreHistory>>,
}

impl CommitHistory {
  pub fn new(retention: usize) -> Self {
    Self {
      retention,
      stores: Mutex::new(HashMap::new()),
    }
  }

  /// Publish a freshly committed transaction and truncate old history.
  /// Callers publish in ordinal order (under the per-store commit mutex).
  pub fn publish(&self, tx: CommittedTransaction) {
    let mut stores = self.stores.lock();
    let history = stores.entry(tx.store.clone()).or_default();

    history.head = tx.ordinal;
    history.entries.push_back(tx);
    while history.entries.len() > self.retention {
      history.entries.pop_front();
    }
    history.retained_floor = history
      .entries
      .front()
      .map(|entry| entry.ordinal)
      .unwrap_or(history.head + 1);
  }

  /// Ordered, gap-free slice of transactions with ordinals above
  /// `last_seen`.
  pub fn updates_since(&self, store: &str, last_seen: TxOrdinal) -> Result<Vec<CommittedTransaction>> {
    let stores = self.stores.lock();
    let Some(history) = stores.get(store) else {
      return Ok(Vec::new());
    };

    if last_seen >= history.head {
      return Ok(Vec::new());
    }

    let requested_from = last_seen.saturating_add(1);
    if requested_from < history.retained_floor {
      return Err(HelmError::UpdateGapTooLarge {
        store: store.to_string(),
        requested_from,
        retained_floor: history.retained_floor,
      });
    }

    Ok(
      history
        .entries
        .iter()
        .filter(|entry| entry.ordinal > last_seen)
        .cloned()
        .collect(),
    )
  }

  /// Names of every store with published history, in sorted order.
  pub fn store_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
    names.sort();
    names
  }

  pub fn head(&self, store: &str) -> TxOrdinal {
    self
      .stores
      .lock()
      .get(store)
      .map(|history| history.head)
      .unwrap_or(0)
  }

  /// Commit proof for an ordinal still inside the retention window.
  pub fn lookup(&self, store: &str, ordinal: TxOrdinal) -> Option<CommitProof> {
    let stores = self.stores.lock();
    let history = stores.get(store)?;
    history
      .entries
      .iter()
      .find(|entry| entry.ordinal == ordinal)
      .map(|entry| CommitProof {
        ordinal: entry.ordinal,
        epoch: entry.epoch,
      })
  }

  /// Discard all retained history. Used on master retirement.
  pub fn clear(&self) {
    self.stores.lock().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::CommitHistory;
  use crate::error::HelmError;
  use crate::types::CommittedTransaction;

  fn tx(ordinal: u64) -> CommittedTransaction {
    CommittedTransaction {
      store: "graph.store".to_string(),
      ordinal,
      epoch: 1,
      payload: ordinal.to_le_bytes().to_vec(),
    }
  }

  #[test]
  fn serves_exactly_the_missing_suffix() {
    let history = CommitHistory::new(16);
    for ordinal in 1..=5 {
      history.publish(tx(ordinal));
    }

    let updates = history.updates_since("graph.store", 2).expect("updates");
    let ordinals: Vec<u64> = updates.iter().map(|entry| entry.ordinal).collect();
    assert_eq!(ordinals, vec![3, 4, 5]);

    assert!(history.updates_since("graph.store", 5).expect("caught up").is_empty());
    assert!(history.updates_since("unknown.store", 0).expect("unknown").is_empty());
  }

  #[test]
  fn truncation_raises_the_floor_and_reports_gaps() {
    let history = CommitHistory::new(8);
    for ordinal in 1..=50 {
      history.publish(tx(ordinal));
    }

    // Retained: 43..=50. A watermark of 42 is still incrementally servable.
    let updates = history.updates_since("graph.store", 42).expect("floor edge");
    assert_eq!(updates.len(), 8);
    assert_eq!(updates[0].ordinal, 43);

    let err = history.updates_since("graph.store", 10).unwrap_err();
    assert!(matches!(
      err,
      HelmError::UpdateGapTooLarge {
        requested_from: 11,
        retained_floor: 43,
        ..
      }
    ));
  }

  #[test]
  fn lookup_inside_and_outside_retention() {
    let history = CommitHistory::new(4);
    for ordinal in 1..=10 {
      history.publish(tx(ordinal));
    }

    let proof = history.lookup("graph.store", 9).expect("retained");
    assert_eq!(proof.ordinal, 9);
    assert_eq!(proof.epoch, 1);
    assert!(history.lookup("graph.store", 2).is_none());
    assert!(history.lookup("graph.store", 11).is_none());
  }
}
