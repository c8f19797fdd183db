use helmdb::storage::MemoryStore;
use helmdb::{CoordinatorOptions, IdRange, MasterCoordinator, ResourceType, SessionContext};
use std::sync::{Arc, Barrier};
use std::thread;

fn open_coordinator(options: CoordinatorOptions) -> MasterCoordinator {
  MasterCoordinator::open(Arc::new(MemoryStore::new()), options)
}

#[test]
fn concurrent_allocations_never_overlap() {
  let coordinator = Arc::new(open_coordinator(CoordinatorOptions::new()));
  let threads = 8;
  let per_thread = 64;
  let barrier = Arc::new(Barrier::new(threads));

  let handles: Vec<_> = (0..threads)
    .map(|_| {
      let coordinator = coordinator.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        let mut ranges = Vec::with_capacity(per_thread);
        for i in 0..per_thread {
          let resource = if i % 2 == 0 {
            ResourceType::Node
          } else {
            ResourceType::Relationship
          };
          ranges.push(coordinator.allocate_ids(resource).expect("allocate"));
        }
        ranges
      })
    })
    .collect();

  let mut all: Vec<IdRange> = Vec::new();
  for handle in handles {
    all.extend(handle.join().expect("join"));
  }

  for resource in [ResourceType::Node, ResourceType::Relationship] {
    let mut ranges: Vec<&IdRange> = all.iter().filter(|range| range.resource == resource).collect();
    ranges.sort_by_key(|range| range.start);
    assert!(!ranges.is_empty());

    for pair in ranges.windows(2) {
      assert!(
        pair[0].end() <= pair[1].start,
        "overlapping ranges for {resource}: {:?} vs {:?}",
        pair[0],
        pair[1]
      );
    }
  }
}

#[test]
fn blocks_are_sized_and_adjacent() {
  let coordinator = open_coordinator(CoordinatorOptions::new().id_block_size(256));

  let first = coordinator.allocate_ids(ResourceType::Node).expect("first");
  let second = coordinator.allocate_ids(ResourceType::Node).expect("second");

  assert_eq!(first.len, 256);
  assert_eq!(first.highest_in_use, first.end() - 1);
  assert_eq!(second.start, first.end());

  // Cursors never collide across resource types.
  let properties = coordinator
    .allocate_ids(ResourceType::PropertyKey)
    .expect("property keys");
  assert_eq!(properties.start, first.start);
}

#[test]
fn racing_relationship_type_creation_converges_on_one_number() {
  let coordinator = Arc::new(open_coordinator(CoordinatorOptions::new()));
  let threads = 6;
  let barrier = Arc::new(Barrier::new(threads));

  let handles: Vec<_> = (0..threads)
    .map(|session| {
      let coordinator = coordinator.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        let ctx = SessionContext::new(session as u64 + 1);
        barrier.wait();
        coordinator
          .create_relationship_type(&ctx, "KNOWS")
          .expect("create type")
          .result
      })
    })
    .collect();

  let numbers: Vec<u32> = handles
    .into_iter()
    .map(|handle| handle.join().expect("join"))
    .collect();
  assert!(numbers.windows(2).all(|pair| pair[0] == pair[1]));

  let ctx = SessionContext::new(99);
  let other = coordinator
    .create_relationship_type(&ctx, "FOLLOWS")
    .expect("other type")
    .result;
  assert_ne!(other, numbers[0]);
}
