use helmdb::storage::MemoryStore;
use helmdb::{
  CommittedTransaction, CoordinatorOptions, HelmError, MasterCoordinator, MasterRole, ResourceType,
  SessionContext, StagedChange,
};
use std::sync::Arc;

const STORE: &str = "graph.store";

fn open_coordinator(options: CoordinatorOptions) -> MasterCoordinator {
  MasterCoordinator::open(Arc::new(MemoryStore::new()), options)
}

fn commit_payload(coordinator: &MasterCoordinator, writer: &SessionContext, payload: &[u8]) -> u64 {
  let change = StagedChange::new(Vec::new(), payload.to_vec());
  coordinator
    .commit(writer, STORE, &change)
    .expect("commit")
    .result
}

#[test]
fn every_reply_piggybacks_unseen_commits_exactly_once() {
  let coordinator = open_coordinator(CoordinatorOptions::new());
  let writer = SessionContext::new(1);
  let replica = SessionContext::new(2);

  for payload in [b"a" as &[u8], b"b", b"c"] {
    commit_payload(&coordinator, &writer, payload);
  }

  // An unrelated lock acquisition carries the full backlog.
  let envelope = coordinator
    .acquire_node_read_lock(&replica, &[99])
    .expect("read lock");
  let ordinals: Vec<u64> = envelope.updates.iter().map(|tx| tx.ordinal).collect();
  assert_eq!(ordinals, vec![1, 2, 3]);

  // Nothing is delivered twice to the same context.
  let envelope = coordinator.pull_updates(&replica).expect("pull");
  assert!(envelope.updates.is_empty());

  commit_payload(&coordinator, &writer, b"d");
  let envelope = coordinator.pull_updates(&replica).expect("pull new");
  let ordinals: Vec<u64> = envelope.updates.iter().map(|tx| tx.ordinal).collect();
  assert_eq!(ordinals, vec![4]);
}

#[test]
fn applying_streams_in_order_converges_to_pulling_after_every_commit() {
  let coordinator = open_coordinator(CoordinatorOptions::new());
  let writer = SessionContext::new(1);
  let eager = SessionContext::new(2);
  let lazy = SessionContext::new(3);

  let mut eager_applied: Vec<CommittedTransaction> = Vec::new();
  for round in 0..20u64 {
    commit_payload(&coordinator, &writer, &round.to_le_bytes());
    let envelope = coordinator.pull_updates(&eager).expect("eager pull");
    eager_applied.extend(envelope.updates);
  }

  let lazy_applied = coordinator.pull_updates(&lazy).expect("lazy pull").updates;

  assert_eq!(eager_applied, lazy_applied);
  let ordinals: Vec<u64> = lazy_applied.iter().map(|tx| tx.ordinal).collect();
  let expected: Vec<u64> = (1..=20).collect();
  assert_eq!(ordinals, expected);
}

#[test]
fn a_context_below_the_retained_floor_must_fully_resynchronize() {
  let coordinator = open_coordinator(CoordinatorOptions::new().history_retention(8));
  let writer = SessionContext::new(1);

  for round in 0..50u64 {
    commit_payload(&coordinator, &writer, &round.to_le_bytes());
  }

  // Retained: ordinals 43..=50. A replica that last saw 10 is too stale.
  let stale = SessionContext::with_applied(2, vec![(STORE.to_string(), 10)]);
  let err = coordinator.pull_updates(&stale).unwrap_err();
  assert!(
    matches!(
      err,
      HelmError::UpdateGapTooLarge {
        requested_from: 11,
        retained_floor: 43,
        ..
      }
    ),
    "got {err}"
  );

  // A replica right at the floor still catches up incrementally.
  let edge = SessionContext::with_applied(3, vec![(STORE.to_string(), 42)]);
  let envelope = coordinator.pull_updates(&edge).expect("edge of retention");
  assert_eq!(envelope.updates.len(), 8);
  assert_eq!(envelope.updates[0].ordinal, 43);
}

#[test]
fn finish_destroys_the_context_and_the_caller_reseeds_it() {
  let coordinator = open_coordinator(CoordinatorOptions::new());
  let writer = SessionContext::new(1);

  for round in 0..5u64 {
    commit_payload(&coordinator, &writer, &round.to_le_bytes());
  }

  let replica = SessionContext::new(2);
  let envelope = coordinator.pull_updates(&replica).expect("first pull");
  assert_eq!(envelope.updates.len(), 5);
  coordinator.finish(&replica).expect("finish");

  // The context is gone; the next call re-seeds from the caller's view.
  let rewound = SessionContext::with_applied(2, vec![(STORE.to_string(), 3)]);
  let envelope = coordinator.pull_updates(&rewound).expect("reseeded pull");
  let ordinals: Vec<u64> = envelope.updates.iter().map(|tx| tx.ordinal).collect();
  assert_eq!(ordinals, vec![4, 5]);
}

#[test]
fn ordinal_lookup_returns_the_defined_unknown_result() {
  let coordinator = open_coordinator(CoordinatorOptions::new());
  let writer = SessionContext::new(1);

  for payload in [b"a" as &[u8], b"b", b"c"] {
    commit_payload(&coordinator, &writer, payload);
  }

  let proof = coordinator
    .master_ordinal_for(STORE, 2)
    .expect("lookup")
    .expect("known ordinal");
  assert_eq!(proof.ordinal, 2);
  assert_eq!(proof.epoch, 1);

  // Never committed through this master: a defined negative result.
  assert_eq!(coordinator.master_ordinal_for(STORE, 99).expect("lookup"), None);
  assert_eq!(coordinator.master_ordinal_for(STORE, 0).expect("lookup"), None);
  assert_eq!(
    coordinator.master_ordinal_for("unknown.store", 1).expect("lookup"),
    None
  );
}

#[test]
fn ordinal_lookup_falls_back_to_the_durable_log_past_retention() {
  let coordinator = open_coordinator(CoordinatorOptions::new().history_retention(2));
  let writer = SessionContext::new(1);

  for round in 0..10u64 {
    commit_payload(&coordinator, &writer, &round.to_le_bytes());
  }

  // Ordinal 1 left the in-memory window long ago; the durable log answers.
  let proof = coordinator
    .master_ordinal_for(STORE, 1)
    .expect("lookup")
    .expect("durable history");
  assert_eq!(proof.ordinal, 1);
}

#[test]
fn a_retired_master_rejects_every_operation() {
  let coordinator = open_coordinator(CoordinatorOptions::new());
  let writer = SessionContext::new(1);
  commit_payload(&coordinator, &writer, b"a");

  coordinator.retire();
  assert_eq!(coordinator.role(), MasterRole::Retired);

  assert!(matches!(
    coordinator.allocate_ids(ResourceType::Node).unwrap_err(),
    HelmError::MasterRetired
  ));
  assert!(matches!(
    coordinator.pull_updates(&writer).unwrap_err(),
    HelmError::MasterRetired
  ));
  assert!(matches!(
    coordinator.finish(&writer).unwrap_err(),
    HelmError::MasterRetired
  ));
  assert!(matches!(
    coordinator
      .commit(&writer, STORE, &StagedChange::new(Vec::new(), b"x".to_vec()))
      .unwrap_err(),
    HelmError::MasterRetired
  ));
  assert!(matches!(
    coordinator.master_ordinal_for(STORE, 1).unwrap_err(),
    HelmError::MasterRetired
  ));
}
