//! Error taxonomy for the master coordinator.

use crate::types::{ResourceId, ResourceType, SessionId, TxOrdinal};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HelmError>;

#[derive(Debug, Error)]
pub enum HelmError {
  /// Identifier space overflow for a resource type. Practically unreachable
  /// but reported rather than crashing.
  #[error("identifier space exhausted for {resource}")]
  AllocationExhausted { resource: ResourceType },

  /// Immediate conflict on an already-granted resource. Recoverable; the
  /// caller is expected to retry with backoff.
  #[error("lock conflict on {resource} {id} (held by session {holder})")]
  LockConflict {
    resource: ResourceType,
    id: ResourceId,
    holder: SessionId,
  },

  /// The lock wait exceeded the configured timeout. Recoverable.
  #[error("lock wait timed out after {waited_ms} ms on {resource} {id}")]
  LockTimeout {
    resource: ResourceType,
    id: ResourceId,
    waited_ms: u64,
  },

  /// The durable append did not succeed. The session's locks remain held;
  /// the caller must retry commit or call finish to release them.
  #[error("commit failed: {0}")]
  CommitFailed(String),

  /// The requested backlog predates retained history. Recoverable only via
  /// full resynchronization, not incremental retry.
  #[error(
    "update gap too large for {store}: requested from {requested_from}, retained floor is {retained_floor}"
  )]
  UpdateGapTooLarge {
    store: String,
    requested_from: TxOrdinal,
    retained_floor: TxOrdinal,
  },

  /// A second concurrent call arrived for a context that already has one in
  /// flight. Never processed concurrently against itself.
  #[error("session {0} has a conflicting call in flight")]
  SessionBusy(SessionId),

  /// The master has transitioned to the retired role; a successor owns
  /// coordination now.
  #[error("master role retired")]
  MasterRetired,

  /// Commit-time verification failed: the session no longer holds the write
  /// locks implicated by its change-set (expired and reclaimed).
  #[error("session {session} no longer holds the locks implicated by its change-set")]
  LocksRevoked { session: SessionId },

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("version mismatch: required {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("internal error: {0}")]
  Internal(String),
}

impl HelmError {
  /// Whether the caller may retry the same call after backoff.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      HelmError::LockConflict { .. } | HelmError::LockTimeout { .. } | HelmError::SessionBusy(_)
    )
  }
}
