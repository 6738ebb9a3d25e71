use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use parking_lot::Mutex;

use crate::backend::{Backend, BackendEntry, BackendFactory};
use crate::builder::CacheMode;
use crate::engine::NetworkLayer;
use crate::entry::{ActiveEntry, EntryHandle};
use crate::metadata::MetadataWriter;
use crate::metrics::Metrics;
use crate::pending::PendingOp;
use crate::task::{Task, TaskQueue};

/// The internal core of the engine: configuration, the deferred-task queue,
/// and the mutable coordination state. Public handles and callbacks share it
/// through an `Arc`; backend completions hold only a `Weak`, which is how
/// cancellation on teardown works.
pub(crate) struct EngineShared {
  pub(crate) weak_self: Weak<EngineShared>,
  pub(crate) state: Mutex<EngineState>,
  pub(crate) tasks: TaskQueue,
  pub(crate) metrics: Metrics,
  pub(crate) mode: CacheMode,
  pub(crate) range_support: bool,
  pub(crate) websocket_over_spdy: bool,
  pub(crate) network: Option<Arc<dyn NetworkLayer>>,
  thread: ThreadId,
}

pub(crate) struct EngineState {
  pub(crate) factory: Option<Box<dyn BackendFactory>>,
  pub(crate) backend: Option<Box<dyn Backend>>,
  pub(crate) building_backend: bool,
  pub(crate) entries: HashMap<EntryHandle, ActiveEntry>,
  pub(crate) active_entries: HashMap<String, EntryHandle>,
  pub(crate) doomed_entries: HashSet<EntryHandle>,
  pub(crate) pending_ops: HashMap<String, PendingOp>,
  pub(crate) playback_counters: Option<HashMap<String, u32>>,
  pub(crate) metadata_writers: HashMap<u64, MetadataWriter>,
  pub(crate) next_entry_id: u64,
  pub(crate) next_transaction_id: u64,
  pub(crate) next_writer_id: u64,
}

impl EngineShared {
  pub(crate) fn new(
    factory: Option<Box<dyn BackendFactory>>,
    mode: CacheMode,
    range_support: bool,
    websocket_over_spdy: bool,
    network: Option<Arc<dyn NetworkLayer>>,
  ) -> Arc<EngineShared> {
    Arc::new_cyclic(|weak| EngineShared {
      weak_self: weak.clone(),
      state: Mutex::new(EngineState {
        factory,
        backend: None,
        building_backend: false,
        entries: HashMap::new(),
        active_entries: HashMap::new(),
        doomed_entries: HashSet::new(),
        pending_ops: HashMap::new(),
        playback_counters: None,
        metadata_writers: HashMap::new(),
        next_entry_id: 0,
        next_transaction_id: 0,
        next_writer_id: 0,
      }),
      tasks: TaskQueue::new(),
      metrics: Metrics::new(),
      mode,
      range_support,
      websocket_over_spdy,
      network,
      thread: thread::current().id(),
    })
  }

  /// The engine is single-threaded by contract; this traps misuse instead of
  /// letting state interleave.
  #[inline]
  pub(crate) fn assert_engine_thread(&self) {
    assert_eq!(
      thread::current().id(),
      self.thread,
      "cache engine used off its owning thread"
    );
  }

  /// Defers work to run after the current call stack unwinds. The closure is
  /// skipped if the engine is torn down before it runs.
  pub(crate) fn post_task<F>(&self, f: F)
  where
    F: FnOnce(&Arc<EngineShared>) + Send + 'static,
  {
    let weak = self.weak_self.clone();
    let task: Task = Box::new(move || {
      if let Some(shared) = weak.upgrade() {
        f(&shared);
      }
    });
    self.tasks.post(task);
  }
}

impl Drop for EngineShared {
  fn drop(&mut self) {
    // Queued transactions are not notified on teardown; their callbacks are
    // simply dropped with the state below. Inflight backend completions hold
    // a dead Weak by now and will discard their results on fire.
    let state = self.state.get_mut();
    if !state.entries.is_empty() || !state.pending_ops.is_empty() {
      tracing::debug!(
        active = state.active_entries.len(),
        doomed = state.doomed_entries.len(),
        pending_ops = state.pending_ops.len(),
        "engine torn down with outstanding work"
      );
    }
  }
}

impl EngineState {
  pub(crate) fn find_active_entry(&self, key: &str) -> Option<EntryHandle> {
    self.active_entries.get(key).copied()
  }

  /// Promotes a freshly opened backend entry into the active set.
  pub(crate) fn activate_entry(
    &mut self,
    key: String,
    backend_entry: Box<dyn BackendEntry>,
    metrics: &Metrics,
  ) -> EntryHandle {
    debug_assert!(self.find_active_entry(&key).is_none());
    let handle = EntryHandle(self.next_entry_id);
    self.next_entry_id += 1;
    self.entries.insert(handle, ActiveEntry::new(backend_entry));
    self.active_entries.insert(key, handle);
    Metrics::bump(&metrics.entries_activated);
    handle
  }

  /// Drops an idle entry. The backend handle closes when the arena slot is
  /// removed.
  pub(crate) fn deactivate_entry(&mut self, handle: EntryHandle, metrics: &Metrics) {
    let key = {
      let entry = self.entries.get(&handle).expect("deactivating unknown entry");
      debug_assert!(!entry.will_process_pending);
      debug_assert!(!entry.doomed);
      debug_assert!(entry.writer.is_none());
      debug_assert!(entry.readers.is_empty());
      debug_assert!(entry.pending.is_empty());
      entry.backend_entry.key()
    };

    if key.is_empty() {
      return self.slow_deactivate_entry(handle, metrics);
    }

    let removed = self.active_entries.remove(&key);
    debug_assert_eq!(removed, Some(handle));
    self.entries.remove(&handle);
    Metrics::bump(&metrics.entries_deactivated);
  }

  /// Fallback for backend entries that no longer report their key: find the
  /// handle by scanning the lookup map.
  fn slow_deactivate_entry(&mut self, handle: EntryHandle, metrics: &Metrics) {
    tracing::warn!(?handle, "backend entry lost its key; deactivating via scan");
    Metrics::bump(&metrics.slow_deactivations);
    let key = self
      .active_entries
      .iter()
      .find(|(_, h)| **h == handle)
      .map(|(k, _)| k.clone());
    if let Some(key) = key {
      self.active_entries.remove(&key);
      self.entries.remove(&handle);
      Metrics::bump(&metrics.entries_deactivated);
    }
  }

  /// Removes a doomed entry once its last holder is gone.
  pub(crate) fn finalize_doomed_entry(&mut self, handle: EntryHandle) {
    {
      let entry = self.entries.get(&handle).expect("finalizing unknown entry");
      debug_assert!(entry.doomed);
      debug_assert!(entry.writer.is_none());
      debug_assert!(entry.readers.is_empty());
      debug_assert!(entry.pending.is_empty());
    }
    let removed = self.doomed_entries.remove(&handle);
    debug_assert!(removed);
    self.entries.remove(&handle);
  }

  pub(crate) fn destroy_entry(&mut self, handle: EntryHandle, metrics: &Metrics) {
    let doomed = self
      .entries
      .get(&handle)
      .map_or(false, |entry| entry.doomed);
    if doomed {
      self.finalize_doomed_entry(handle);
    } else {
      self.deactivate_entry(handle, metrics);
    }
  }

  /// The serialization point for backend calls on `key`, created on demand.
  pub(crate) fn get_pending_op(&mut self, key: &str) -> &mut PendingOp {
    debug_assert!(self.find_active_entry(key).is_none());
    self
      .pending_ops
      .entry(key.to_string())
      .or_insert_with(PendingOp::new)
  }

  pub(crate) fn delete_pending_op(&mut self, key: &str) {
    if let Some(op) = self.pending_ops.remove(key) {
      debug_assert!(op.writer.is_none());
      debug_assert!(op.queue.is_empty());
    }
  }
}
