//! Session/context registry: per-replica watermarks, call exclusivity, and
//! idle-expiry bookkeeping.

use crate::error::{HelmError, Result};
use crate::types::{SessionContext, SessionId, TxOrdinal};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SessionState {
  watermarks: IndexMap<String, TxOrdinal>,
  last_activity: Instant,
  in_flight: bool,
}

/// Master-side registry of live replica sessions. A context is created on a
/// replica's first call (seeded from the watermarks the replica supplies),
/// touched on every call, and destroyed on finish or idle expiry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
  sessions: Mutex<IndexMap<SessionId, SessionState>>,
}

/// Exclusivity token for one in-flight call on a session. Dropping it ends
/// the call and stamps the session's activity clock.
#[derive(Debug)]
pub struct CallGuard<'a> {
  registry: &'a SessionRegistry,
  session: SessionId,
}

impl Drop for CallGuard<'_> {
  fn drop(&mut self) {
    let mut sessions = self.registry.sessions.lock();
    if let Some(state) = sessions.get_mut(&self.session) {
      state.in_flight = false;
      state.last_activity = Instant::now();
    }
  }
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register-or-touch the session and take its in-flight guard. A second
  /// concurrent call on the same context is rejected, never run against
  /// itself.
  pub fn begin_call(&self, ctx: &SessionContext) -> Result<CallGuard<'_>> {
    let mut sessions = self.sessions.lock();
    let state = sessions.entry(ctx.session_id).or_insert_with(|| SessionState {
      watermarks: ctx
        .last_applied
        .iter()
        .map(|(store, ordinal)| (store.clone(), *ordinal))
        .collect(),
      last_activity: Instant::now(),
      in_flight: false,
    });

    if state.in_flight {
      return Err(HelmError::SessionBusy(ctx.session_id));
    }
    state.in_flight = true;
    state.last_activity = Instant::now();

    Ok(CallGuard {
      registry: self,
      session: ctx.session_id,
    })
  }

  /// Last ordinal delivered to the session for a store (0 if never).
  pub fn watermark(&self, session: SessionId, store: &str) -> TxOrdinal {
    self
      .sessions
      .lock()
      .get(&session)
      .and_then(|state| state.watermarks.get(store))
      .copied()
      .unwrap_or(0)
  }

  /// Advance a watermark to what was actually delivered. Never moves
  /// backwards.
  pub fn advance(&self, session: SessionId, store: &str, delivered: TxOrdinal) {
    let mut sessions = self.sessions.lock();
    if let Some(state) = sessions.get_mut(&session) {
      let watermark = state.watermarks.entry(store.to_string()).or_insert(0);
      *watermark = (*watermark).max(delivered);
    }
  }

  pub fn remove(&self, session: SessionId) -> bool {
    self.sessions.lock().shift_remove(&session).is_some()
  }

  pub fn contains(&self, session: SessionId) -> bool {
    self.sessions.lock().contains_key(&session)
  }

  pub fn len(&self) -> usize {
    self.sessions.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.sessions.lock().is_empty()
  }

  /// Sessions idle longer than `timeout`, oldest registration first.
  /// In-flight sessions are never reported.
  pub fn expired(&self, timeout: Duration) -> Vec<SessionId> {
    let now = Instant::now();
    self
      .sessions
      .lock()
      .iter()
      .filter(|(_, state)| !state.in_flight && now.duration_since(state.last_activity) >= timeout)
      .map(|(session, _)| *session)
      .collect()
  }

  /// Drop every context. Used on master retirement.
  pub fn clear(&self) {
    self.sessions.lock().clear();
  }
}

#[cfg(test)]
mod tests {
  use super::SessionRegistry;
  use crate::error::HelmError;
  use crate::types::SessionContext;
  use std::time::Duration;

  #[test]
  fn concurrent_calls_on_one_session_are_rejected() {
    let registry = SessionRegistry::new();
    let ctx = SessionContext::new(1);

    let guard = registry.begin_call(&ctx).expect("first call");
    let err = registry.begin_call(&ctx).unwrap_err();
    assert!(matches!(err, HelmError::SessionBusy(1)));

    drop(guard);
    registry.begin_call(&ctx).expect("after first call ends");
  }

  #[test]
  fn watermarks_seed_from_context_and_only_advance() {
    let registry = SessionRegistry::new();
    let ctx = SessionContext::with_applied(7, vec![("graph.store".to_string(), 12)]);

    drop(registry.begin_call(&ctx).expect("register"));
    assert_eq!(registry.watermark(7, "graph.store"), 12);
    assert_eq!(registry.watermark(7, "index.store"), 0);

    registry.advance(7, "graph.store", 20);
    registry.advance(7, "graph.store", 15);
    assert_eq!(registry.watermark(7, "graph.store"), 20);
  }

  #[test]
  fn expiry_skips_in_flight_sessions() {
    let registry = SessionRegistry::new();
    let ctx = SessionContext::new(3);

    let guard = registry.begin_call(&ctx).expect("register");
    assert!(registry.expired(Duration::ZERO).is_empty());

    drop(guard);
    assert_eq!(registry.expired(Duration::ZERO), vec![3]);
    assert!(registry.expired(Duration::from_secs(3600)).is_empty());
  }

  #[test]
  fn remove_is_idempotent() {
    let registry = SessionRegistry::new();
    drop(registry.begin_call(&SessionContext::new(9)).expect("register"));
    assert!(registry.remove(9));
    assert!(!registry.remove(9));
    assert!(registry.is_empty());
  }
}
