//! In-memory transaction store for tests and embedded single-process use.

use super::TransactionStore;
use crate::error::{HelmError, Result};
use crate::types::{CommittedTransaction, Epoch, TxOrdinal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MemoryStore {
  logs: Mutex<HashMap<String, Vec<CommittedTransaction>>>,
  fail_appends: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Test helper: make every subsequent append fail until cleared, to
  /// exercise commit failure paths.
  pub fn fail_appends(&self, fail: bool) {
    self.fail_appends.store(fail, Ordering::SeqCst);
  }
}

impl TransactionStore for MemoryStore {
  fn append(&self, store: &str, ordinal: TxOrdinal, epoch: Epoch, payload: &[u8]) -> Result<()> {
    if self.fail_appends.load(Ordering::SeqCst) {
      return Err(HelmError::Internal("injected append failure".to_string()));
    }

    let mut logs = self.logs.lock();
    let log = logs.entry(store.to_string()).or_default();

    let expected = log.last().map(|tx| tx.ordinal + 1).unwrap_or(1);
    if ordinal != expected {
      return Err(HelmError::Internal(format!(
        "non-contiguous append to {store}: ordinal {ordinal}, expected {expected}"
      )));
    }

    log.push(CommittedTransaction {
      store: store.to_string(),
      ordinal,
      epoch,
      payload: payload.to_vec(),
    });
    Ok(())
  }

  fn read_from(&self, store: &str, from: TxOrdinal) -> Result<Vec<CommittedTransaction>> {
    let logs = self.logs.lock();
    Ok(
      logs
        .get(store)
        .map(|log| {
          log
            .iter()
            .filter(|tx| tx.ordinal >= from)
            .cloned()
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn head(&self, store: &str) -> Result<Option<TxOrdinal>> {
    let logs = self.logs.lock();
    Ok(
      logs
        .get(store)
        .and_then(|log| log.last())
        .map(|tx| tx.ordinal),
    )
  }
}
