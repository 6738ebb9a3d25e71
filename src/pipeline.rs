//! The pending-operation pipeline: every backend-bound request funnels
//! through a per-key `PendingOp`. Only the first enqueuer launches the
//! backend call; followers queue and are dispatched against the primary
//! outcome when it completes.

use std::sync::Arc;

use crate::backend::{
  Backend, BackendCompletion, BackendEntry, BackendOp, FactoryCompletion, FactoryOp,
};
use crate::metrics::Metrics;
use crate::pending::{UserCallback, WorkItem, WorkItemKind};
use crate::shared::EngineShared;
use crate::status::CacheStatus;
use crate::transaction::Transaction;

enum Started {
  /// Joined an existing inflight call or suspended behind a fresh one.
  Pending,
  /// The backend finished synchronously; run the completion inline.
  Sync(CacheStatus, Option<Box<dyn BackendEntry>>),
}

impl EngineShared {
  pub(crate) fn open_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.assert_engine_thread();
    trans.bind_key(key);
    {
      let state = self.state.lock();
      if let Some(handle) = state.find_active_entry(key) {
        trans.entry_slot().set(Some(handle));
        Metrics::bump(&self.metrics.fast_path_hits);
        return CacheStatus::Ok;
      }
    }
    let item = WorkItem::for_entry(WorkItemKind::OpenEntry, trans);
    self.start_entry_op(WorkItemKind::OpenEntry, key, item)
  }

  pub(crate) fn create_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.assert_engine_thread();
    trans.bind_key(key);
    debug_assert!(self.state.lock().find_active_entry(key).is_none());
    let item = WorkItem::for_entry(WorkItemKind::CreateEntry, trans);
    self.start_entry_op(WorkItemKind::CreateEntry, key, item)
  }

  pub(crate) fn async_doom_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.assert_engine_thread();
    let item = WorkItem::for_doom(trans);
    self.start_entry_op(WorkItemKind::DoomEntry, key, item)
  }

  fn start_entry_op(&self, kind: WorkItemKind, key: &str, item: WorkItem) -> CacheStatus {
    let started = {
      let mut state = self.state.lock();
      if state.backend.is_none() {
        // The transaction should have waited on get_backend_for_transaction.
        return CacheStatus::Failed;
      }
      {
        let op = state.get_pending_op(key);
        if op.writer.is_some() {
          op.queue.push_back(item);
          Metrics::bump(&self.metrics.backend_joins);
          return CacheStatus::IoPending;
        }
        debug_assert!(op.queue.is_empty());
        op.writer = Some(item);
      }
      let completion = self.backend_completion(key.to_string());
      let backend = state.backend.as_ref().unwrap();
      let started = match kind {
        WorkItemKind::OpenEntry => backend.open_entry(key, completion),
        WorkItemKind::CreateEntry => backend.create_entry(key, completion),
        WorkItemKind::DoomEntry => backend.doom_entry(key, completion),
        WorkItemKind::CreateBackend => unreachable!("backend creation uses its own path"),
      };
      match started {
        BackendOp::Pending => Started::Pending,
        BackendOp::Done(status, entry) => {
          // Synchronous return: the caller receives the status directly, so
          // suppress the io callback while keeping the entry slot live.
          let op = state.pending_ops.get_mut(key).unwrap();
          op.writer.as_mut().unwrap().clear_transaction();
          Started::Sync(status, entry)
        }
      }
    };
    match started {
      Started::Pending => CacheStatus::IoPending,
      Started::Sync(status, entry) => {
        self.on_io_complete(key, status, entry);
        self.tasks.drain();
        status
      }
    }
  }

  /// Starts or joins backend construction. `callback` is the `get_backend`
  /// sink; lazy-initialization passes `None` and has its item dropped when a
  /// construction is already underway.
  pub(crate) fn create_backend(&self, callback: Option<UserCallback>) -> CacheStatus {
    self.assert_engine_thread();
    enum FactoryStarted {
      Pending,
      Sync(CacheStatus, Option<Box<dyn Backend>>),
    }
    let started = {
      let mut state = self.state.lock();
      if state.factory.is_none() {
        return CacheStatus::Failed;
      }
      state.building_backend = true;
      let item = WorkItem::for_backend(None, callback);
      {
        let op = state.get_pending_op("");
        if op.writer.is_some() {
          if item.has_callback() {
            op.queue.push_back(item);
          }
          Metrics::bump(&self.metrics.backend_joins);
          return CacheStatus::IoPending;
        }
        debug_assert!(op.queue.is_empty());
        op.writer = Some(item);
      }
      let completion = self.factory_completion();
      match state.factory.as_mut().unwrap().create(completion) {
        FactoryOp::Pending => FactoryStarted::Pending,
        FactoryOp::Done(status, backend) => {
          // The caller gets the status as the return value; drop the user
          // sink so it does not fire a second time.
          let op = state.pending_ops.get_mut("").unwrap();
          op.writer.as_mut().unwrap().clear_callback();
          FactoryStarted::Sync(status, backend)
        }
      }
    };
    match started {
      FactoryStarted::Pending => CacheStatus::IoPending,
      FactoryStarted::Sync(status, backend) => {
        self.on_backend_created(status, backend);
        self.tasks.drain();
        status
      }
    }
  }

  /// A transaction waiting for the backend joins the construction op's
  /// queue; it is notified through its io callback when the backend lands.
  pub(crate) fn get_backend_for_transaction(&self, trans: &Arc<Transaction>) -> CacheStatus {
    self.assert_engine_thread();
    let mut state = self.state.lock();
    if state.backend.is_some() {
      return CacheStatus::Ok;
    }
    if !state.building_backend {
      return CacheStatus::Failed;
    }
    let item = WorkItem::for_backend(Some(trans), None);
    let op = state.get_pending_op("");
    debug_assert!(op.writer.is_some());
    op.queue.push_back(item);
    Metrics::bump(&self.metrics.backend_joins);
    CacheStatus::IoPending
  }

  fn backend_completion(&self, key: String) -> BackendCompletion {
    let weak = self.weak_self.clone();
    Box::new(move |status, entry| match weak.upgrade() {
      Some(shared) => {
        shared.on_io_complete(&key, status, entry);
        shared.tasks.drain();
      }
      // The engine is gone; close the orphaned handle and walk away. The
      // pending op died with the engine and nobody is waiting.
      None => drop(entry),
    })
  }

  fn factory_completion(&self) -> FactoryCompletion {
    let weak = self.weak_self.clone();
    Box::new(move |status, backend| match weak.upgrade() {
      Some(shared) => {
        shared.on_backend_created(status, backend);
        shared.tasks.drain();
      }
      None => drop(backend),
    })
  }

  /// Completion dispatch for open/create/doom. Activates or discards the
  /// backend entry, then drains the snapshot of queued followers, mapping
  /// each onto the primary outcome.
  pub(crate) fn on_io_complete(
    &self,
    key: &str,
    result: CacheStatus,
    mut backend_entry: Option<Box<dyn BackendEntry>>,
  ) {
    self.assert_engine_thread();
    debug_assert!(result != CacheStatus::IoPending);

    let (primary, queued, primary_kind, real_key, mut fail_requests, entry_handle) = {
      let mut state = self.state.lock();
      let Some(mut op) = state.pending_ops.remove(key) else {
        // Torn down while the call was inflight.
        return;
      };
      let item = op.writer.take().expect("backend completion without an inflight item");
      let primary_kind = item.kind;
      debug_assert!(primary_kind != WorkItemKind::CreateBackend);

      let mut fail_requests = false;
      let mut entry_handle = None;
      let mut real_key = String::new();
      if result == CacheStatus::Ok {
        if primary_kind == WorkItemKind::DoomEntry {
          // Anything queued behind a doom has to restart.
          fail_requests = true;
        } else if item.is_valid() {
          let entry = backend_entry.take().expect("backend reported Ok without an entry");
          real_key = entry.key();
          entry_handle = Some(state.activate_entry(real_key.clone(), entry, &self.metrics));
        } else {
          // The requesting transaction is gone. A cancelled create must not
          // leave a stray entry behind; either way the handle closes here.
          let entry = backend_entry.take().expect("backend reported Ok without an entry");
          if primary_kind == WorkItemKind::CreateEntry {
            entry.doom();
          }
          drop(entry);
          fail_requests = true;
        }
      }
      // Snapshot the queue, then drop the op from the map: the notifications
      // below may synchronously re-enqueue work for this key, and it must
      // land in a fresh PendingOp behind this batch.
      let queued = std::mem::take(&mut op.queue);
      (item, queued, primary_kind, real_key, fail_requests, entry_handle)
    };

    primary.notify(result, entry_handle);

    for queued_item in queued {
      let mut current_entry = None;
      {
        let state = self.state.lock();
        if queued_item.kind == WorkItemKind::DoomEntry {
          // A queued doom request is always a race.
          fail_requests = true;
        } else if result == CacheStatus::Ok {
          current_entry = state.find_active_entry(&real_key);
          if current_entry.is_none() {
            // An earlier notification already took the entry down.
            fail_requests = true;
          }
        }
      }

      if fail_requests {
        Metrics::bump(&self.metrics.races_signaled);
        queued_item.notify(CacheStatus::CacheRace, None);
        continue;
      }

      if queued_item.kind == WorkItemKind::CreateEntry {
        if result == CacheStatus::Ok {
          // A second create, but the first one succeeded: duplicate key.
          Metrics::bump(&self.metrics.create_collisions);
          queued_item.notify(CacheStatus::CacheCreateFailure, None);
        } else if primary_kind != WorkItemKind::CreateEntry {
          // Failed open followed by a create; the state is ambiguous.
          Metrics::bump(&self.metrics.races_signaled);
          queued_item.notify(CacheStatus::CacheRace, None);
          fail_requests = true;
        } else {
          queued_item.notify(result, current_entry);
        }
      } else if primary_kind == WorkItemKind::CreateEntry && result != CacheStatus::Ok {
        // Failed create followed by an open.
        Metrics::bump(&self.metrics.races_signaled);
        queued_item.notify(CacheStatus::CacheRace, None);
        fail_requests = true;
      } else {
        queued_item.notify(result, current_entry);
      }
    }
  }

  /// Completion dispatch for backend construction. The first completion
  /// consumes the factory and installs the backend; queued construction
  /// items are promoted one per tick because any callback may tear the
  /// engine down.
  pub(crate) fn on_backend_created(&self, result: CacheStatus, mut backend: Option<Box<dyn Backend>>) {
    self.assert_engine_thread();
    let item = {
      let mut state = self.state.lock();
      let (item, requeue) = {
        let Some(op) = state.pending_ops.get_mut("") else {
          return;
        };
        let item = op.writer.take().expect("construction completion without an inflight item");
        debug_assert!(item.kind == WorkItemKind::CreateBackend);
        let requeue = match op.queue.pop_front() {
          Some(next) => {
            debug_assert!(next.kind == WorkItemKind::CreateBackend);
            op.writer = Some(next);
            true
          }
          None => false,
        };
        (item, requeue)
      };

      if state.factory.is_some() {
        state.factory = None;
        if result == CacheStatus::Ok {
          state.backend = backend.take();
        }
        tracing::debug!(status = %result, "cache backend construction finished");
      }

      if requeue {
        self.post_task(move |shared| shared.on_backend_created(result, None));
      } else {
        state.building_backend = false;
        state.delete_pending_op("");
      }
      item
    };
    item.deliver_backend(result);
  }
}
