//! Global identifier authority: block allocation per resource type.

use crate::error::{HelmError, Result};
use crate::types::{IdRange, ResourceType};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Headroom guard below u64::MAX; reaching it reports `AllocationExhausted`
/// instead of wrapping.
pub const MAX_ID: u64 = 1 << 60;

#[derive(Debug, Default)]
struct RelationshipTypeRegistry {
  by_name: HashMap<String, u32>,
}

/// Hands out globally-unique, non-overlapping identifier ranges. Cursors
/// only ever move forward; ranges are never returned to the pool.
pub struct IdAuthority {
  block_size: u64,
  cursors: [Mutex<u64>; ResourceType::ALL.len()],
  relationship_types: Mutex<RelationshipTypeRegistry>,
}

impl IdAuthority {
  pub fn new(block_size: u64) -> Self {
    Self {
      block_size: block_size.max(1),
      // Id 0 is kept back as a null sentinel.
      cursors: [Mutex::new(1), Mutex::new(1), Mutex::new(1), Mutex::new(1)],
      relationship_types: Mutex::new(RelationshipTypeRegistry::default()),
    }
  }

  /// Allocate the next block for a resource type. Concurrent calls for the
  /// same type serialize on that type's cursor and never overlap.
  pub fn allocate(&self, resource: ResourceType) -> Result<IdRange> {
    let mut cursor = self.cursors[resource.index()].lock();
    let start = *cursor;
    let end = start
      .checked_add(self.block_size)
      .filter(|end| *end <= MAX_ID)
      .ok_or(HelmError::AllocationExhausted { resource })?;
    *cursor = end;

    Ok(IdRange {
      resource,
      start,
      len: self.block_size,
      highest_in_use: end - 1,
    })
  }

  /// Define a named relationship type, numbered through the same cursor the
  /// type's identifier blocks come from. A repeat create for an existing
  /// name returns the already-assigned number; it never burns a second id.
  pub fn create_relationship_type(&self, name: &str) -> Result<u32> {
    let mut registry = self.relationship_types.lock();
    if let Some(id) = registry.by_name.get(name) {
      return Ok(*id);
    }

    let id = {
      let mut cursor = self.cursors[ResourceType::RelationshipType.index()].lock();
      let id = *cursor;
      if id > u32::MAX as u64 {
        return Err(HelmError::AllocationExhausted {
          resource: ResourceType::RelationshipType,
        });
      }
      *cursor = id + 1;
      id as u32
    };

    registry.by_name.insert(name.to_string(), id);
    Ok(id)
  }

  /// Number previously assigned to a relationship type name, if any.
  pub fn relationship_type(&self, name: &str) -> Option<u32> {
    self.relationship_types.lock().by_name.get(name).copied()
  }

  #[cfg(test)]
  fn set_cursor_for_testing(&self, resource: ResourceType, value: u64) {
    *self.cursors[resource.index()].lock() = value;
  }
}
