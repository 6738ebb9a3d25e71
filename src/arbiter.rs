//! Reader/writer arbitration over active entries.
//!
//! One writer or any number of readers hold an entry at a time; everything
//! else waits on the entry's FIFO pending queue. Queue drains are debounced
//! through `will_process_pending` and run from the deferred-task queue, so a
//! batch of finishing readers triggers a single pass.

use std::sync::Arc;

use crate::entry::EntryHandle;
use crate::metrics::Metrics;
use crate::shared::{EngineShared, EngineState};
use crate::status::CacheStatus;
use crate::transaction::{Transaction, TransactionMode};

impl EngineShared {
  pub(crate) fn add_transaction_to_entry(
    &self,
    handle: EntryHandle,
    trans: &Arc<Transaction>,
  ) -> CacheStatus {
    self.assert_engine_thread();
    let rv = {
      let mut state = self.state.lock();
      self.add_transaction_locked(&mut state, handle, trans)
    };
    self.tasks.drain();
    rv
  }

  pub(crate) fn add_transaction_locked(
    &self,
    state: &mut EngineState,
    handle: EntryHandle,
    trans: &Arc<Transaction>,
  ) -> CacheStatus {
    let Some(entry) = state.entries.get_mut(&handle) else {
      debug_assert!(false, "admission against a destroyed entry");
      return CacheStatus::Failed;
    };

    if entry.writer.is_some() || entry.will_process_pending {
      entry.pending.push_back(Arc::clone(trans));
      Metrics::bump(&self.metrics.pending_admissions);
      return CacheStatus::IoPending;
    }

    if trans.mode().writes() {
      // Exclusive access; readers must drain first.
      if !entry.readers.is_empty() {
        entry.pending.push_back(Arc::clone(trans));
        Metrics::bump(&self.metrics.pending_admissions);
        return CacheStatus::IoPending;
      }
      entry.writer = Some(Arc::clone(trans));
      return CacheStatus::Ok;
    }

    entry.readers.push(Arc::clone(trans));

    // Scheduling before this call returns forces later arrivals onto the
    // pending queue, which keeps admission FIFO.
    let needs_pass = entry.writer.is_none() && !entry.pending.is_empty();
    if needs_pass {
      self.schedule_process_pending(state, handle);
    }
    CacheStatus::Ok
  }

  /// Coalesced: a second call while a drain is scheduled is a no-op.
  pub(crate) fn schedule_process_pending(&self, state: &mut EngineState, handle: EntryHandle) {
    let Some(entry) = state.entries.get_mut(&handle) else {
      return;
    };
    if entry.will_process_pending {
      return;
    }
    entry.will_process_pending = true;
    self.post_task(move |shared| shared.on_process_pending(handle));
  }

  fn on_process_pending(&self, handle: EntryHandle) {
    let mut notify = None;
    {
      let mut state = self.state.lock();
      let next = {
        let Some(entry) = state.entries.get_mut(&handle) else {
          return;
        };
        entry.will_process_pending = false;
        debug_assert!(entry.writer.is_none());

        if entry.pending.is_empty() {
          if entry.readers.is_empty() {
            state.destroy_entry(handle, &self.metrics);
          }
          return;
        }

        // A waiting writer cannot start over live readers; the last reader's
        // completion reschedules this pass.
        let head_writes = entry.pending.front().unwrap().mode().writes();
        if head_writes && !entry.readers.is_empty() {
          return;
        }
        entry.pending.pop_front().unwrap()
      };

      let rv = self.add_transaction_locked(&mut state, handle, &next);
      if rv != CacheStatus::IoPending {
        notify = Some((next, rv));
      }
    }
    if let Some((trans, rv)) = notify {
      trans.notify(rv);
    }
  }

  /// A transaction is done with an entry it holds or waits on. For the
  /// writer, `cancel` decides whether the partially written entry is kept as
  /// truncated (range support permitting) or doomed.
  pub(crate) fn done_with_entry(&self, handle: EntryHandle, trans: &Arc<Transaction>, cancel: bool) {
    self.assert_engine_thread();
    enum Role {
      Writer(bool),
      Reader,
      None,
    }
    let role = {
      let mut state = self.state.lock();
      let Some(entry) = state.entries.get_mut(&handle) else {
        return;
      };
      // A destruction pass is already in flight; nothing to cancel.
      if entry.will_process_pending && entry.readers.is_empty() {
        Role::None
      } else if entry.writer.is_some() {
        debug_assert!(entry.writer_is(trans));
        let mut success = false;
        if cancel {
          success = trans.add_truncated_flag();
        }
        Role::Writer(success)
      } else {
        Role::Reader
      }
    };
    match role {
      Role::Writer(success) => self.done_writing_to_entry(handle, success),
      Role::Reader => self.done_reading_from_entry(handle, trans),
      Role::None => {}
    }
  }

  pub(crate) fn done_writing_to_entry(&self, handle: EntryHandle, success: bool) {
    self.assert_engine_thread();
    let waiters = {
      let mut state = self.state.lock();
      let failed_waiters = {
        let Some(entry) = state.entries.get_mut(&handle) else {
          debug_assert!(false, "writer completion against a destroyed entry");
          return;
        };
        debug_assert!(entry.readers.is_empty());
        entry.writer = None;
        if success {
          None
        } else {
          debug_assert!(!entry.will_process_pending);
          // The entry contents are unusable; every waiter restarts the whole
          // open/create cycle.
          let waiters: Vec<Arc<Transaction>> = entry.pending.drain(..).collect();
          entry.backend_entry.doom();
          Some(waiters)
        }
      };
      match failed_waiters {
        None => {
          self.schedule_process_pending(&mut state, handle);
          Vec::new()
        }
        Some(waiters) => {
          state.destroy_entry(handle, &self.metrics);
          waiters
        }
      }
    };
    for trans in waiters {
      Metrics::bump(&self.metrics.races_signaled);
      trans.notify(CacheStatus::CacheRace);
    }
    self.tasks.drain();
  }

  pub(crate) fn done_reading_from_entry(&self, handle: EntryHandle, trans: &Arc<Transaction>) {
    self.assert_engine_thread();
    {
      let mut state = self.state.lock();
      {
        let Some(entry) = state.entries.get_mut(&handle) else {
          debug_assert!(false, "reader completion against a destroyed entry");
          return;
        };
        debug_assert!(entry.writer.is_none());
        let removed = entry.remove_reader(trans);
        debug_assert!(removed, "transaction was not a reader of this entry");
      }
      self.schedule_process_pending(&mut state, handle);
    }
    self.tasks.drain();
  }

  /// Downgrades a READ_WRITE writer whose writes are complete into a reader,
  /// letting queued readers join it.
  pub(crate) fn convert_writer_to_reader(&self, handle: EntryHandle) {
    self.assert_engine_thread();
    {
      let mut state = self.state.lock();
      {
        let Some(entry) = state.entries.get_mut(&handle) else {
          debug_assert!(false, "downgrade against a destroyed entry");
          return;
        };
        let writer = entry.writer.take().expect("no writer to downgrade");
        debug_assert!(writer.mode() == TransactionMode::READ_WRITE);
        debug_assert!(entry.readers.is_empty());
        entry.readers.push(writer);
      }
      self.schedule_process_pending(&mut state, handle);
    }
    self.tasks.drain();
  }

  /// Removes the entry from the lookup map while existing holders finish.
  /// Falls back to the pending pipeline when the key has no active entry.
  pub(crate) fn doom_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.assert_engine_thread();
    trans.bind_key(key);
    let doomed = {
      let mut state = self.state.lock();
      match state.active_entries.remove(key) {
        Some(handle) => {
          state.doomed_entries.insert(handle);
          let entry = state.entries.get_mut(&handle).unwrap();
          entry.backend_entry.doom();
          entry.doomed = true;
          // An idle entry should have been deactivated, not doomed.
          debug_assert!(entry.writer.is_some() || !entry.readers.is_empty());
          Metrics::bump(&self.metrics.entries_doomed);
          true
        }
        None => false,
      }
    };
    if doomed {
      return CacheStatus::Ok;
    }
    self.async_doom_entry(key, trans)
  }
}
