//! Durable transaction-log collaborator boundary.
//!
//! The coordinator never interprets transaction payloads; it only appends
//! them durably and reads them back for catch-up and ordinal lookup.

pub mod log;
pub mod memory;

pub use log::SegmentLog;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{CommittedTransaction, Epoch, TxOrdinal};

/// Storage collaborator serving the master's durable commit log, one
/// ordinal-contiguous sequence per store.
pub trait TransactionStore: Send + Sync {
  /// Durably record one committed transaction. Returns only after the entry
  /// is on stable storage; an error means the commit must not be exposed.
  fn append(&self, store: &str, ordinal: TxOrdinal, epoch: Epoch, payload: &[u8]) -> Result<()>;

  /// Read committed history with ordinals `>= from`, in ordinal order.
  fn read_from(&self, store: &str, from: TxOrdinal) -> Result<Vec<CommittedTransaction>>;

  /// Highest ordinal durably recorded for a store, if any.
  fn head(&self, store: &str) -> Result<Option<TxOrdinal>>;
}
