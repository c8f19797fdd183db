//! Session-scoped read/write lock arbitration over graph resources.
//!
//! Acquisition over multiple ids is all-or-nothing and always proceeds in
//! canonical ascending id order. Conflicting requests wait on a condvar up
//! to the caller's timeout; fairness is FIFO-ish best effort only.

use crate::error::{HelmError, Result};
use crate::types::{LockGrant, LockMode, ResourceId, ResourceType, SessionId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type ResourceKey = (ResourceType, ResourceId);

#[derive(Debug, Default)]
struct ResourceLocks {
  readers: HashMap<SessionId, u32>,
  writer: Option<(SessionId, u32)>,
}

impl ResourceLocks {
  fn is_free(&self) -> bool {
    self.readers.is_empty() && self.writer.is_none()
  }

  /// A conflicting holder, if any. A session's own grants never conflict
  /// with its new request: reads are re-entrant and a sole reader may
  /// upgrade to write.
  fn conflicting_holder(&self, session: SessionId, mode: LockMode) -> Option<SessionId> {
    if let Some((writer, _)) = self.writer {
      if writer != session {
        return Some(writer);
      }
    }
    if mode == LockMode::Write {
      if let Some(reader) = self.readers.keys().find(|reader| **reader != session) {
        return Some(*reader);
      }
    }
    None
  }

  fn grant(&mut self, session: SessionId, mode: LockMode) {
    match mode {
      LockMode::Read => *self.readers.entry(session).or_insert(0) += 1,
      LockMode::Write => match &mut self.writer {
        Some((_, count)) => *count += 1,
        None => self.writer = Some((session, 1)),
      },
    }
  }

  fn release(&mut self, session: SessionId, mode: LockMode) {
    match mode {
      LockMode::Read => {
        if let Some(count) = self.readers.get_mut(&session) {
          *count -= 1;
          if *count == 0 {
            self.readers.remove(&session);
          }
        }
      }
      LockMode::Write => {
        if let Some((writer, count)) = &mut self.writer {
          if *writer == session {
            *count -= 1;
            if *count == 0 {
              self.writer = None;
            }
          }
        }
      }
    }
  }
}

#[derive(Debug, Default)]
struct TableState {
  resources: HashMap<ResourceKey, ResourceLocks>,
  sessions: HashMap<SessionId, Vec<(ResourceKey, LockMode)>>,
}

impl TableState {
  fn first_conflict(
    &self,
    session: SessionId,
    resource: ResourceType,
    ids: &[ResourceId],
    mode: LockMode,
  ) -> Option<(ResourceId, SessionId)> {
    for id in ids {
      if let Some(locks) = self.resources.get(&(resource, *id)) {
        if let Some(holder) = locks.conflicting_holder(session, mode) {
          return Some((*id, holder));
        }
      }
    }
    None
  }

  fn grant_all(
    &mut self,
    session: SessionId,
    resource: ResourceType,
    ids: &[ResourceId],
    mode: LockMode,
  ) {
    let held = self.sessions.entry(session).or_default();
    for id in ids {
      self
        .resources
        .entry((resource, *id))
        .or_default()
        .grant(session, mode);
      held.push(((resource, *id), mode));
    }
  }
}

#[derive(Debug, Default)]
pub struct LockTable {
  state: Mutex<TableState>,
  released: Condvar,
}

impl LockTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Acquire `mode` locks on every id, or none of them. Blocks up to
  /// `timeout` on conflict; a zero timeout fails immediately with
  /// `LockConflict`, an expired wait with `LockTimeout`. A failed call
  /// leaves no partial grant behind.
  pub fn acquire(
    &self,
    session: SessionId,
    resource: ResourceType,
    ids: &[ResourceId],
    mode: LockMode,
    timeout: Duration,
  ) -> Result<LockGrant> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let started = Instant::now();
    let deadline = started + timeout;
    let mut state = self.state.lock();

    loop {
      match state.first_conflict(session, resource, &ids, mode) {
        None => {
          state.grant_all(session, resource, &ids, mode);
          return Ok(LockGrant {
            resource,
            mode,
            ids,
          });
        }
        Some((id, holder)) => {
          if timeout.is_zero() {
            return Err(HelmError::LockConflict {
              resource,
              id,
              holder,
            });
          }
          if Instant::now() >= deadline {
            warn!(
              session,
              %resource,
              id,
              holder,
              "lock wait timed out"
            );
            return Err(HelmError::LockTimeout {
              resource,
              id,
              waited_ms: started.elapsed().as_millis() as u64,
            });
          }
          debug!(session, %resource, id, holder, "waiting for contended lock");
          self.released.wait_until(&mut state, deadline);
        }
      }
    }
  }

  /// Release every grant held by a session and wake all waiters. Returns
  /// the number of grants released; releasing nothing is not an error.
  pub fn release_session(&self, session: SessionId) -> usize {
    let released = {
      let mut state = self.state.lock();
      let Some(held) = state.sessions.remove(&session) else {
        return 0;
      };

      for (key, mode) in &held {
        if let Some(locks) = state.resources.get_mut(key) {
          locks.release(session, *mode);
          if locks.is_free() {
            state.resources.remove(key);
          }
        }
      }
      held.len()
    };

    if released > 0 {
      self.released.notify_all();
    }
    released
  }

  /// Read-only commit-time verification: does the session hold a write
  /// grant on every implicated resource?
  pub fn holds_write_set(&self, session: SessionId, write_set: &[(ResourceType, ResourceId)]) -> bool {
    let state = self.state.lock();
    write_set.iter().all(|key| {
      state
        .resources
        .get(key)
        .and_then(|locks| locks.writer)
        .is_some_and(|(writer, _)| writer == session)
    })
  }

  /// Number of grants a session currently holds.
  pub fn held_by(&self, session: SessionId) -> usize {
    self
      .state
      .lock()
      .sessions
      .get(&session)
      .map(Vec::len)
      .unwrap_or(0)
  }

  /// Discard every grant. Used on master retirement.
  pub fn clear(&self) {
    let mut state = self.state.lock();
    state.resources.clear();
    state.sessions.clear();
    drop(state);
    self.released.notify_all();
  }
}
