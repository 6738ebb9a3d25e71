use std::sync::Arc;
use std::time::SystemTime;

use url::Url;

use crate::builder::CacheMode;
use crate::entry::{EntryHandle, EntryStats};
use crate::error::BuildError;
use crate::key::{self, RequestInfo};
use crate::metrics::MetricsSnapshot;
use crate::pending::PendingOp;
use crate::shared::EngineShared;
use crate::status::{CacheStatus, LoadState};
use crate::transaction::{IoCallback, Transaction, TransactionMode};

/// The network layer the engine delegates connection management to.
pub trait NetworkLayer: Send + Sync {
  fn close_current_connections(&self);
  fn suspend(&self, suspend: bool);
}

/// The coordination engine.
///
/// The engine multiplexes transactions over one shared backend: per key there
/// is at most one writer and any number of readers, and whatever cannot be
/// admitted immediately waits in FIFO order. All methods must be called on
/// the thread that built the engine; suspending operations return
/// [`CacheStatus::IoPending`] and finish through the transaction's io
/// callback.
pub struct CacheEngine {
  shared: Arc<EngineShared>,
}

impl CacheEngine {
  pub(crate) fn from_shared(shared: Arc<EngineShared>) -> CacheEngine {
    CacheEngine { shared }
  }

  /// Creates a transaction handle, lazily kicking off backend construction
  /// so the cache is warm by the time the transaction needs it.
  pub fn create_transaction(
    &self,
    mode: TransactionMode,
    io_callback: IoCallback,
  ) -> Result<Arc<Transaction>, BuildError> {
    self.shared.assert_engine_thread();
    if mode.is_none() {
      return Err(BuildError::InvalidTransactionMode);
    }
    if self.shared.state.lock().backend.is_none() {
      // Result discarded; the transaction joins the construction later if it
      // has to.
      let _ = self.shared.create_backend(None);
    }
    let id = {
      let mut state = self.shared.state.lock();
      let id = state.next_transaction_id;
      state.next_transaction_id += 1;
      id
    };
    Ok(Transaction::new(
      id,
      mode,
      self.shared.range_support,
      io_callback,
    ))
  }

  /// Resolves the backend, constructing it on first use. Returns `Ok` when
  /// it already exists; otherwise `IoPending` and `callback` fires exactly
  /// once, or `Failed` when no factory remains.
  pub fn get_backend<F>(&self, callback: F) -> CacheStatus
  where
    F: FnOnce(CacheStatus) + Send + 'static,
  {
    self.shared.assert_engine_thread();
    if self.shared.state.lock().backend.is_some() {
      return CacheStatus::Ok;
    }
    self.shared.create_backend(Some(Box::new(callback)))
  }

  /// Like `get_backend`, but parks the transaction on the construction op;
  /// its io callback delivers the result.
  pub fn get_backend_for_transaction(&self, trans: &Arc<Transaction>) -> CacheStatus {
    self.shared.get_backend_for_transaction(trans)
  }

  pub fn has_backend(&self) -> bool {
    self.shared.state.lock().backend.is_some()
  }

  pub fn is_building_backend(&self) -> bool {
    self.shared.state.lock().building_backend
  }

  /// Derives the cache key for a request under the engine's mode.
  ///
  /// Panics in [`CacheMode::Disable`]: a disabled cache has no keys, so
  /// asking for one is a programming error.
  pub fn generate_cache_key(&self, request: &RequestInfo) -> String {
    self.shared.generate_cache_key(request)
  }

  /// Opens the entry for `key`, serving the active set first. On success the
  /// transaction's entry slot holds the handle.
  pub fn open_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.shared.open_entry(key, trans)
  }

  pub fn create_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.shared.create_entry(key, trans)
  }

  /// Removes the entry from the lookup map; existing holders finish
  /// unaffected and the entry is finalized when the last one is done.
  pub fn doom_entry(&self, key: &str, trans: &Arc<Transaction>) -> CacheStatus {
    self.shared.doom_entry(key, trans)
  }

  /// Admits the transaction as the writer or a reader, or queues it.
  pub fn add_transaction_to_entry(
    &self,
    entry: EntryHandle,
    trans: &Arc<Transaction>,
  ) -> CacheStatus {
    self.shared.add_transaction_to_entry(entry, trans)
  }

  /// Done with an entry, normally or by cancellation. A cancelling writer
  /// keeps the entry only if the truncation flag could be recorded.
  pub fn done_with_entry(&self, entry: EntryHandle, trans: &Arc<Transaction>, cancel: bool) {
    self.shared.done_with_entry(entry, trans, cancel)
  }

  /// The writer finished. On failure the entry is doomed and every waiter is
  /// told to restart with `CacheRace`.
  pub fn done_writing_to_entry(&self, entry: EntryHandle, success: bool) {
    self.shared.done_writing_to_entry(entry, success)
  }

  pub fn done_reading_from_entry(&self, entry: EntryHandle, trans: &Arc<Transaction>) {
    self.shared.done_reading_from_entry(entry, trans)
  }

  /// Downgrades a READ_WRITE writer into a reader once its writes are done.
  pub fn convert_writer_to_reader(&self, entry: EntryHandle) {
    self.shared.convert_writer_to_reader(entry)
  }

  /// Drops a queued transaction from wherever it waits. Panics if it is not
  /// queued anywhere; cancelling an admitted transaction goes through
  /// `done_with_entry` instead.
  pub fn remove_pending_transaction(&self, trans: &Arc<Transaction>) {
    self.shared.remove_pending_transaction(trans)
  }

  /// Progress report for a transaction still waiting to be admitted.
  pub fn get_load_state_for_pending_transaction(&self, trans: &Arc<Transaction>) -> LoadState {
    self.shared.assert_engine_thread();
    let state = self.shared.state.lock();
    let Some(key) = trans.key() else {
      return LoadState::WaitingForCache;
    };
    state
      .find_active_entry(&key)
      .and_then(|handle| state.entries.get(&handle))
      .and_then(|entry| entry.writer.as_ref())
      .map_or(LoadState::WaitingForCache, |writer| writer.writer_load_state())
  }

  /// Writes an opaque metadata blob against the cached response for `url`,
  /// provided the stored response time matches exactly. Fire-and-forget;
  /// failures are silent.
  pub fn write_metadata(&self, url: &Url, expected_response_time: SystemTime, buf: &[u8]) {
    self.shared.write_metadata(url, expected_response_time, buf)
  }

  pub fn close_current_connections(&self) {
    self.shared.assert_engine_thread();
    if let Some(network) = &self.shared.network {
      network.close_current_connections();
    }
  }

  pub fn suspend(&self, suspend: bool) {
    self.shared.assert_engine_thread();
    if let Some(network) = &self.shared.network {
      network.suspend(suspend);
    }
  }

  pub fn mode(&self) -> CacheMode {
    self.shared.mode
  }

  pub fn range_support(&self) -> bool {
    self.shared.range_support
  }

  pub fn websocket_over_spdy(&self) -> bool {
    self.shared.websocket_over_spdy
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  // --- Introspection, mainly for diagnostics and tests ---

  pub fn has_active_entry(&self, key: &str) -> bool {
    self.shared.state.lock().find_active_entry(key).is_some()
  }

  pub fn doomed_entry_count(&self) -> usize {
    self.shared.state.lock().doomed_entries.len()
  }

  /// A snapshot of one entry's holders, or `None` once it is destroyed.
  pub fn entry_stats(&self, entry: EntryHandle) -> Option<EntryStats> {
    self.shared.state.lock().entries.get(&entry).map(|e| e.stats())
  }
}

impl EngineShared {
  pub(crate) fn generate_cache_key(&self, request: &RequestInfo) -> String {
    assert!(
      self.mode != CacheMode::Disable,
      "generate_cache_key called on a disabled cache"
    );
    match self.mode {
      CacheMode::Normal => key::normal_key(request),
      CacheMode::Playback | CacheMode::Record => {
        // Each lookup tags the key with a generation number so successive
        // fetches of one URL address distinct cached instances.
        let mut state = self.state.lock();
        let counters = state.playback_counters.get_or_insert_with(Default::default);
        let url = key::spec_for_request(&request.url);
        let generation = counters.get(&url).copied().unwrap_or(0);
        counters.insert(url, generation + 1);
        key::playback_key(generation, request)
      }
      CacheMode::Disable => unreachable!(),
    }
  }

  pub(crate) fn remove_pending_transaction(&self, trans: &Arc<Transaction>) {
    self.assert_engine_thread();
    let mut state = self.state.lock();
    let key = trans.key();
    let mut found = false;

    if let Some(key) = &key {
      if let Some(handle) = state.find_active_entry(key) {
        let entry = state.entries.get_mut(&handle).unwrap();
        found = entry.remove_pending(trans);
      }
    }

    if !found && state.building_backend {
      if let Some(op) = state.pending_ops.get_mut("") {
        found = remove_pending_from_op(op, trans);
      }
    }

    if !found {
      if let Some(key) = &key {
        if let Some(op) = state.pending_ops.get_mut(key.as_str()) {
          found = remove_pending_from_op(op, trans);
        }
      }
    }

    if !found {
      let doomed: Vec<EntryHandle> = state.doomed_entries.iter().copied().collect();
      for handle in doomed {
        let entry = state.entries.get_mut(&handle).unwrap();
        if entry.remove_pending(trans) {
          found = true;
          break;
        }
      }
    }

    assert!(found, "pending transaction not found");
  }
}

/// The inflight item keeps its backend call running; only its sinks are
/// cleared. Queued items are dropped outright.
fn remove_pending_from_op(op: &mut PendingOp, trans: &Arc<Transaction>) -> bool {
  if op.writer.as_ref().map_or(false, |writer| writer.matches(trans)) {
    let writer = op.writer.as_mut().unwrap();
    writer.clear_transaction();
    writer.clear_entry_slot();
    return true;
  }
  match op.queue.iter().position(|item| item.matches(trans)) {
    Some(index) => {
      op.queue.remove(index);
      true
    }
    None => false,
  }
}
