//! Core identifier, lock, and transaction types shared across the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one replica session.
pub type SessionId = u64;

/// Identifier of a lockable graph resource (node id, relationship id).
pub type ResourceId = u64;

/// Master-assigned commit sequence number, one sequence per store.
pub type TxOrdinal = u64;

/// Master incarnation counter, bumped on every handover.
pub type Epoch = u64;

/// Identifier and lock domains the master arbitrates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
  Node,
  Relationship,
  RelationshipType,
  PropertyKey,
}

impl ResourceType {
  pub const ALL: [ResourceType; 4] = [
    ResourceType::Node,
    ResourceType::Relationship,
    ResourceType::RelationshipType,
    ResourceType::PropertyKey,
  ];

  pub const fn index(self) -> usize {
    match self {
      ResourceType::Node => 0,
      ResourceType::Relationship => 1,
      ResourceType::RelationshipType => 2,
      ResourceType::PropertyKey => 3,
    }
  }

  pub const fn code(self) -> u8 {
    self.index() as u8
  }

  pub const fn from_code(code: u8) -> Option<ResourceType> {
    match code {
      0 => Some(ResourceType::Node),
      1 => Some(ResourceType::Relationship),
      2 => Some(ResourceType::RelationshipType),
      3 => Some(ResourceType::PropertyKey),
      _ => None,
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      ResourceType::Node => "node",
      ResourceType::Relationship => "relationship",
      ResourceType::RelationshipType => "relationship-type",
      ResourceType::PropertyKey => "property-key",
    };
    write!(f, "{value}")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
  Read,
  Write,
}

impl fmt::Display for LockMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      LockMode::Read => "read",
      LockMode::Write => "write",
    };
    write!(f, "{value}")
  }
}

/// A block of identifiers issued to one replica. Ranges are never reused or
/// revoked, even if the replica crashes before exhausting the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
  pub resource: ResourceType,
  pub start: u64,
  pub len: u64,
  pub highest_in_use: u64,
}

impl IdRange {
  /// First identifier past the end of the range.
  pub const fn end(&self) -> u64 {
    self.start + self.len
  }

  pub const fn contains(&self, id: u64) -> bool {
    id >= self.start && id < self.end()
  }
}

/// One committed transaction as retained for catch-up delivery. Immutable
/// once created; only ever superseded by truncation of old history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTransaction {
  pub store: String,
  pub ordinal: TxOrdinal,
  pub epoch: Epoch,
  pub payload: Vec<u8>,
}

/// A replica's view of its own session: its id plus the last transaction
/// ordinal it has applied per store. The master seeds its session registry
/// from this on first contact and keeps its own watermarks afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
  pub session_id: SessionId,
  pub last_applied: Vec<(String, TxOrdinal)>,
}

impl SessionContext {
  pub fn new(session_id: SessionId) -> Self {
    Self {
      session_id,
      last_applied: Vec::new(),
    }
  }

  pub fn with_applied(session_id: SessionId, last_applied: Vec<(String, TxOrdinal)>) -> Self {
    Self {
      session_id,
      last_applied,
    }
  }
}

/// Result of a successful lock acquisition. Held until finish or session
/// expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
  pub resource: ResourceType,
  pub mode: LockMode,
  pub ids: Vec<ResourceId>,
}

/// Authoritative commit position returned by the ordinal lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitProof {
  pub ordinal: TxOrdinal,
  pub epoch: Epoch,
}

/// The fundamental reply contract: every operation's result is coupled with
/// the committed transactions the calling context has not yet observed.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope<T> {
  pub result: T,
  pub updates: Vec<CommittedTransaction>,
}

impl<T> ResponseEnvelope<T> {
  pub fn new(result: T, updates: Vec<CommittedTransaction>) -> Self {
    Self { result, updates }
  }
}
