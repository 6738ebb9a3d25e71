mod common;

use common::*;
use weft_cache::{CacheStatus, EngineBuilder, TransactionMode};

#[test]
fn second_create_loses_against_successful_first() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let first = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "w1"))
    .unwrap();
  let second = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "w2"))
    .unwrap();

  assert_eq!(engine.create_entry("k3", &first), CacheStatus::IoPending);
  assert_eq!(engine.create_entry("k3", &second), CacheStatus::IoPending);
  // Only the first enqueuer reaches the backend.
  assert_eq!(ctl.held_count(), 1);

  ctl.complete_next_ok();

  assert_eq!(
    events(&log),
    vec![
      ("w1", CacheStatus::Ok),
      ("w2", CacheStatus::CacheCreateFailure),
    ]
  );
  assert!(first.new_entry().is_some());
  assert!(second.new_entry().is_none());
  assert_eq!(engine.metrics().create_collisions, 1);
}

#[test]
fn create_queued_behind_failed_open_must_restart() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let opener = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "open"))
    .unwrap();
  let creator = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "create"))
    .unwrap();

  assert_eq!(engine.open_entry("k", &opener), CacheStatus::IoPending);
  assert_eq!(engine.create_entry("k", &creator), CacheStatus::IoPending);

  ctl.complete_next(CacheStatus::NotFound);

  assert_eq!(
    events(&log),
    vec![
      ("open", CacheStatus::NotFound),
      ("create", CacheStatus::CacheRace),
    ]
  );
}

#[test]
fn open_queued_behind_failed_create_must_restart() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let creator = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "create"))
    .unwrap();
  let opener = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "open"))
    .unwrap();

  assert_eq!(engine.create_entry("k", &creator), CacheStatus::IoPending);
  assert_eq!(engine.open_entry("k", &opener), CacheStatus::IoPending);

  ctl.complete_next(CacheStatus::Failed);

  assert_eq!(
    events(&log),
    vec![
      ("create", CacheStatus::Failed),
      ("open", CacheStatus::CacheRace),
    ]
  );
}

#[test]
fn queued_create_shares_the_primary_create_failure() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let first = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "w1"))
    .unwrap();
  let second = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "w2"))
    .unwrap();

  assert_eq!(engine.create_entry("k", &first), CacheStatus::IoPending);
  assert_eq!(engine.create_entry("k", &second), CacheStatus::IoPending);

  ctl.complete_next(CacheStatus::Failed);

  // A duplicate-key collision never happened; both see the same backend
  // failure.
  assert_eq!(
    events(&log),
    vec![("w1", CacheStatus::Failed), ("w2", CacheStatus::Failed)]
  );
}

#[test]
fn queued_doom_is_always_a_race() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let opener = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "open"))
    .unwrap();
  let doomer = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "doom"))
    .unwrap();

  assert_eq!(engine.open_entry("k", &opener), CacheStatus::IoPending);
  assert_eq!(engine.doom_entry("k", &doomer), CacheStatus::IoPending);

  ctl.complete_next_ok();

  assert_eq!(
    events(&log),
    vec![("open", CacheStatus::Ok), ("doom", CacheStatus::CacheRace)]
  );
}

#[test]
fn concurrent_get_backend_calls_share_one_construction() {
  let (engine, ctl) = mock_engine();
  ctl.hold_backend_creation();
  let log = event_log();

  let log1 = log.clone();
  let log2 = log.clone();
  assert_eq!(
    engine.get_backend(move |status| log1.lock().unwrap().push(("cb1", status))),
    CacheStatus::IoPending
  );
  assert_eq!(
    engine.get_backend(move |status| log2.lock().unwrap().push(("cb2", status))),
    CacheStatus::IoPending
  );
  assert_eq!(ctl.factory_calls(), 1);

  complete_backend(&ctl, CacheStatus::Ok);

  assert!(engine.has_backend());
  assert!(!engine.is_building_backend());
  assert_eq!(
    events(&log),
    vec![("cb1", CacheStatus::Ok), ("cb2", CacheStatus::Ok)]
  );

  // The backend is installed; later calls are synchronous.
  assert_eq!(engine.get_backend(|_| {}), CacheStatus::Ok);
  assert_eq!(ctl.factory_calls(), 1);
}

#[test]
fn transaction_can_wait_for_backend_construction() {
  let (engine, ctl) = mock_engine();
  ctl.hold_backend_creation();
  let log = event_log();

  let trans = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t"))
    .unwrap();
  assert!(engine.is_building_backend());
  assert_eq!(engine.get_backend_for_transaction(&trans), CacheStatus::IoPending);

  complete_backend(&ctl, CacheStatus::Ok);

  assert_eq!(events(&log), vec![("t", CacheStatus::Ok)]);
  assert_eq!(engine.get_backend_for_transaction(&trans), CacheStatus::Ok);
}

#[test]
fn failed_construction_reaches_every_waiter_once() {
  let (engine, ctl) = mock_engine();
  ctl.hold_backend_creation();
  let log = event_log();

  let log1 = log.clone();
  assert_eq!(
    engine.get_backend(move |status| log1.lock().unwrap().push(("cb", status))),
    CacheStatus::IoPending
  );
  let trans = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t"))
    .unwrap();
  assert_eq!(engine.get_backend_for_transaction(&trans), CacheStatus::IoPending);

  complete_backend(&ctl, CacheStatus::Failed);

  assert_eq!(
    events(&log),
    vec![("cb", CacheStatus::Failed), ("t", CacheStatus::Failed)]
  );
  assert!(!engine.has_backend());
  assert!(!engine.is_building_backend());
  // The factory is consumed; the engine is permanently without a backend.
  assert_eq!(engine.get_backend(|_| {}), CacheStatus::Failed);
}

#[test]
fn engine_without_factory_fails_backend_operations() {
  let engine = EngineBuilder::new().build();
  let log = event_log();
  assert_eq!(engine.get_backend(|_| {}), CacheStatus::Failed);
  let trans = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &trans), CacheStatus::Failed);
}

#[test]
fn removed_pending_transaction_is_never_notified() {
  let (engine, _ctl) = mock_engine();
  let log = event_log();

  let writer = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "w"))
    .unwrap();
  assert_eq!(engine.create_entry("k", &writer), CacheStatus::Ok);
  let handle = writer.new_entry().unwrap();
  assert_eq!(engine.add_transaction_to_entry(handle, &writer), CacheStatus::Ok);

  let reader = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "r"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &reader), CacheStatus::Ok);
  assert_eq!(
    engine.add_transaction_to_entry(handle, &reader),
    CacheStatus::IoPending
  );

  engine.remove_pending_transaction(&reader);
  engine.done_writing_to_entry(handle, true);

  // The reader never hears back; with no holders left the entry is gone.
  assert!(events(&log).is_empty());
  assert!(!engine.has_active_entry("k"));
}

#[test]
fn cancelling_the_inflight_opener_discards_the_fresh_entry() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let opener = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "open"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &opener), CacheStatus::IoPending);

  engine.remove_pending_transaction(&opener);
  let probe = ctl.complete_next_ok().unwrap();

  // Nobody wants the entry: it is closed, not activated, and the opener is
  // not notified.
  assert!(events(&log).is_empty());
  assert!(!engine.has_active_entry("k"));
  assert_eq!(probe.close_count(), 1);
  assert!(!probe.is_doomed());
}

#[test]
fn cancelling_the_inflight_creator_dooms_the_fresh_entry() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let creator = engine
    .create_transaction(TransactionMode::READ_WRITE, recorder(&log, "create"))
    .unwrap();
  assert_eq!(engine.create_entry("k", &creator), CacheStatus::IoPending);

  engine.remove_pending_transaction(&creator);
  let probe = ctl.complete_next_ok().unwrap();

  assert!(events(&log).is_empty());
  assert!(!engine.has_active_entry("k"));
  assert_eq!(probe.close_count(), 1);
  assert!(probe.is_doomed());
}

#[test]
fn cancelling_a_queued_follower_leaves_the_primary_alone() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let first = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t1"))
    .unwrap();
  let second = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t2"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &first), CacheStatus::IoPending);
  assert_eq!(engine.open_entry("k", &second), CacheStatus::IoPending);

  engine.remove_pending_transaction(&second);
  ctl.complete_next_ok();

  assert_eq!(events(&log), vec![("t1", CacheStatus::Ok)]);
  assert!(engine.has_active_entry("k"));
}

#[test]
fn active_entry_and_pending_op_never_coexist() {
  let (engine, ctl) = mock_engine();
  ctl.hold_entry_ops();
  let log = event_log();

  let trans = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "t"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &trans), CacheStatus::IoPending);
  assert!(!engine.has_active_entry("k"));

  ctl.complete_next_ok();
  assert!(engine.has_active_entry("k"));

  // Re-enqueueing for the same key after activation hits the fast path, not
  // a new pending op.
  let again = engine
    .create_transaction(TransactionMode::READ, recorder(&log, "again"))
    .unwrap();
  assert_eq!(engine.open_entry("k", &again), CacheStatus::Ok);
  assert_eq!(
    ctl
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|op| matches!(op, MockOp::Open(k) if k == "k"))
      .count(),
    1
  );
}
