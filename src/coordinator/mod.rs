//! Master coordination facade: request dispatch, update piggybacking, and
//! the master role state machine.

pub mod commit;
pub mod history;
pub mod id_authority;
pub mod lock_table;
pub mod session;

pub use commit::{ChangeExtractor, StagedChange};
pub use id_authority::IdAuthority;
pub use lock_table::LockTable;
pub use session::SessionRegistry;

use crate::config::CoordinatorOptions;
use crate::error::{HelmError, Result};
use crate::storage::TransactionStore;
use crate::types::{
  CommitProof, CommittedTransaction, IdRange, LockGrant, LockMode, ResourceId, ResourceType,
  ResponseEnvelope, SessionContext, SessionId, TxOrdinal,
};
use commit::CommitSequencer;
use crossbeam_channel::{bounded, Sender};
use history::CommitHistory;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// The coordinator's role lifecycle. `Active -> Retired` is one-way: a
/// retired master discards its in-memory coordination state and rejects
/// every request, and a successor rebuilds from durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterRole {
  Active,
  Retired,
}

/// The master side of the cluster coordination protocol. One logical worker
/// serves each inbound call; every shared structure carries its own
/// smallest-scope lock.
pub struct MasterCoordinator {
  options: CoordinatorOptions,
  role: Mutex<MasterRole>,
  ids: IdAuthority,
  locks: Arc<LockTable>,
  sessions: Arc<SessionRegistry>,
  history: CommitHistory,
  sequencer: CommitSequencer,
  storage: Arc<dyn TransactionStore>,
  sweep_stop: Sender<()>,
  sweep_handle: Option<JoinHandle<()>>,
}

impl MasterCoordinator {
  /// Start coordinating against a durable transaction store. Spawns the
  /// session expiry sweep, which runs until the coordinator is dropped.
  pub fn open(storage: Arc<dyn TransactionStore>, options: CoordinatorOptions) -> Self {
    let locks = Arc::new(LockTable::new());
    let sessions = Arc::new(SessionRegistry::new());

    let (sweep_stop, stop_rx) = bounded::<()>(1);
    let sweep_locks = locks.clone();
    let sweep_sessions = sessions.clone();
    let session_timeout = options.session_timeout;
    let sweep_interval = options.sweep_interval;

    let sweep_handle = std::thread::spawn(move || loop {
      match stop_rx.recv_timeout(sweep_interval) {
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
          for session in sweep_sessions.expired(session_timeout) {
            let released = sweep_locks.release_session(session);
            sweep_sessions.remove(session);
            warn!(session, released, "expired idle session; reclaimed locks");
          }
        }
        _ => break,
      }
    });

    info!(epoch = options.epoch, "master coordinator active");

    Self {
      ids: IdAuthority::new(options.id_block_size),
      history: CommitHistory::new(options.history_retention),
      sequencer: CommitSequencer::new(options.epoch),
      role: Mutex::new(MasterRole::Active),
      locks,
      sessions,
      storage,
      sweep_stop,
      sweep_handle: Some(sweep_handle),
      options,
    }
  }

  pub fn role(&self) -> MasterRole {
    *self.role.lock()
  }

  fn ensure_active(&self) -> Result<()> {
    match *self.role.lock() {
      MasterRole::Active => Ok(()),
      MasterRole::Retired => Err(HelmError::MasterRetired),
    }
  }

  /// Allocate the next identifier block for a resource type. The one
  /// context-free operation: no session, no piggybacked updates.
  pub fn allocate_ids(&self, resource: ResourceType) -> Result<IdRange> {
    self.ensure_active()?;
    self.ids.allocate(resource)
  }

  /// Define a named relationship type; idempotent per name.
  pub fn create_relationship_type(
    &self,
    ctx: &SessionContext,
    name: &str,
  ) -> Result<ResponseEnvelope<u32>> {
    self.with_session(ctx, |coordinator| {
      coordinator.ids.create_relationship_type(name)
    })
  }

  pub fn acquire_node_write_lock(
    &self,
    ctx: &SessionContext,
    ids: &[ResourceId],
  ) -> Result<ResponseEnvelope<LockGrant>> {
    self.acquire_lock(ctx, ResourceType::Node, ids, LockMode::Write)
  }

  pub fn acquire_node_read_lock(
    &self,
    ctx: &SessionContext,
    ids: &[ResourceId],
  ) -> Result<ResponseEnvelope<LockGrant>> {
    self.acquire_lock(ctx, ResourceType::Node, ids, LockMode::Read)
  }

  pub fn acquire_relationship_write_lock(
    &self,
    ctx: &SessionContext,
    ids: &[ResourceId],
  ) -> Result<ResponseEnvelope<LockGrant>> {
    self.acquire_lock(ctx, ResourceType::Relationship, ids, LockMode::Write)
  }

  pub fn acquire_relationship_read_lock(
    &self,
    ctx: &SessionContext,
    ids: &[ResourceId],
  ) -> Result<ResponseEnvelope<LockGrant>> {
    self.acquire_lock(ctx, ResourceType::Relationship, ids, LockMode::Read)
  }

  /// Acquire locks in any resource domain. Held until finish or expiry.
  pub fn acquire_lock(
    &self,
    ctx: &SessionContext,
    resource: ResourceType,
    ids: &[ResourceId],
    mode: LockMode,
  ) -> Result<ResponseEnvelope<LockGrant>> {
    self.with_session(ctx, |coordinator| {
      coordinator.locks.acquire(
        ctx.session_id,
        resource,
        ids,
        mode,
        coordinator.options.lock_timeout,
      )
    })
  }

  /// Commit a single-store transaction. Verifies the session still holds
  /// every implicated write lock (a session whose locks were reclaimed by
  /// expiry must not commit), then assigns the next ordinal under the
  /// store's commit mutex and appends durably.
  pub fn commit(
    &self,
    ctx: &SessionContext,
    store: &str,
    extractor: &dyn ChangeExtractor,
  ) -> Result<ResponseEnvelope<TxOrdinal>> {
    self.with_session(ctx, |coordinator| {
      let write_set = extractor.write_set();
      if !write_set.is_empty() && !coordinator.locks.holds_write_set(ctx.session_id, &write_set) {
        return Err(HelmError::LocksRevoked {
          session: ctx.session_id,
        });
      }

      let payload = extractor.extract()?;
      let ordinal =
        coordinator
          .sequencer
          .commit(store, &payload, coordinator.storage.as_ref(), &coordinator.history)?;
      debug!(session = ctx.session_id, store, ordinal, "committed transaction");
      Ok(ordinal)
    })
  }

  /// Release every lock the session holds and drop its context. Idempotent:
  /// finishing a finished (or never-started) context succeeds as a no-op.
  pub fn finish(&self, ctx: &SessionContext) -> Result<ResponseEnvelope<()>> {
    self.ensure_active()?;
    let guard = self.sessions.begin_call(ctx)?;

    let released = self.locks.release_session(ctx.session_id);
    if released > 0 {
      debug!(session = ctx.session_id, released, "released session locks on finish");
    }

    let updates = self.collect_updates(ctx.session_id)?;
    drop(guard);
    self.sessions.remove(ctx.session_id);
    Ok(ResponseEnvelope::new((), updates))
  }

  /// Catch-up with no other side effect.
  pub fn pull_updates(&self, ctx: &SessionContext) -> Result<ResponseEnvelope<()>> {
    self.with_session(ctx, |_| Ok(()))
  }

  /// Authoritative ordinal lookup for a replica's locally-recorded commit.
  /// `None` is the defined unknown result: the transaction never passed
  /// through this master's log, which signals a fault in the replica's own
  /// record.
  pub fn master_ordinal_for(&self, store: &str, local_txid: TxOrdinal) -> Result<Option<CommitProof>> {
    self.ensure_active()?;
    if local_txid == 0 {
      return Ok(None);
    }

    if let Some(proof) = self.history.lookup(store, local_txid) {
      return Ok(Some(proof));
    }

    // Older than the retention window: consult the durable log.
    let head = self.storage.head(store)?.unwrap_or(0);
    if local_txid > head {
      return Ok(None);
    }
    Ok(
      self
        .storage
        .read_from(store, local_txid)?
        .into_iter()
        .find(|entry| entry.ordinal == local_txid)
        .map(|entry| CommitProof {
          ordinal: entry.ordinal,
          epoch: entry.epoch,
        }),
    )
  }

  /// One-way `Active -> Retired` transition on role loss. In-memory
  /// coordination state is discarded; replicas observe forced-resync
  /// semantics against the successor.
  pub fn retire(&self) {
    *self.role.lock() = MasterRole::Retired;
    self.locks.clear();
    self.sessions.clear();
    self.history.clear();
    self.sequencer.clear();
    info!("master role retired; in-memory coordination state discarded");
  }

  /// Run an envelope-producing operation under the session's in-flight
  /// guard, then attach every update the context has not yet observed and
  /// advance its watermarks to exactly what was sent.
  fn with_session<T>(
    &self,
    ctx: &SessionContext,
    operation: impl FnOnce(&Self) -> Result<T>,
  ) -> Result<ResponseEnvelope<T>> {
    self.ensure_active()?;
    let guard = self.sessions.begin_call(ctx)?;
    let result = operation(self)?;
    let updates = self.collect_updates(ctx.session_id)?;
    drop(guard);
    Ok(ResponseEnvelope::new(result, updates))
  }

  fn collect_updates(&self, session: SessionId) -> Result<Vec<CommittedTransaction>> {
    let mut updates: Vec<CommittedTransaction> = Vec::new();
    let mut delivered: Vec<(String, TxOrdinal)> = Vec::new();

    for store in self.history.store_names() {
      let watermark = self.sessions.watermark(session, &store);
      let stream = self.history.updates_since(&store, watermark)?;
      if let Some(last) = stream.last() {
        delivered.push((store.clone(), last.ordinal));
      }
      updates.extend(stream);
    }

    // Advance only after every stream resolved, so a gap failure on one
    // store does not half-advance the context.
    for (store, ordinal) in delivered {
      self.sessions.advance(session, &store, ordinal);
    }
    Ok(updates)
  }
}

impl Drop for MasterCoordinator {
  fn drop(&mut self) {
    let _ = self.sweep_stop.send(());
    if let Some(handle) = self.sweep_handle.take() {
      let _ = handle.join();
    }
  }
}
