use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::EntryHandle;
use crate::status::{CacheStatus, LoadState};

/// Callback a transaction supplies to receive engine completions.
pub type IoCallback = Box<dyn Fn(CacheStatus) + Send + Sync>;

/// Access bits requested by a transaction.
///
/// `READ_WRITE` transactions may be downgraded to readers once their writes
/// are complete (see `CacheEngine::convert_writer_to_reader`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMode(u8);

impl TransactionMode {
  pub const NONE: TransactionMode = TransactionMode(0);
  pub const READ: TransactionMode = TransactionMode(1);
  pub const WRITE: TransactionMode = TransactionMode(2);
  pub const READ_WRITE: TransactionMode = TransactionMode(3);

  #[inline]
  pub fn contains(self, bits: TransactionMode) -> bool {
    self.0 & bits.0 == bits.0
  }

  /// True when the WRITE bit is set.
  #[inline]
  pub fn writes(self) -> bool {
    self.contains(TransactionMode::WRITE)
  }

  #[inline]
  pub fn is_none(self) -> bool {
    self.0 == 0
  }
}

/// Out-cell an open/create operation fills with the resulting entry handle
/// before the transaction's io callback runs.
#[derive(Debug, Default)]
pub struct EntrySlot {
  cell: Mutex<Option<EntryHandle>>,
}

impl EntrySlot {
  pub(crate) fn set(&self, entry: Option<EntryHandle>) {
    *self.cell.lock() = entry;
  }

  pub fn get(&self) -> Option<EntryHandle> {
    *self.cell.lock()
  }
}

/// The engine-side handle for one HTTP transaction.
///
/// The HTTP state machine drives this object through the engine: it asks for
/// an entry, waits on the io callback when an operation suspends, and reports
/// completion through `done_*` calls. The transaction itself holds no
/// reference back to the engine; entries are addressed by handle and looked
/// up on every use.
pub struct Transaction {
  id: u64,
  mode: TransactionMode,
  range_support: bool,
  key: Mutex<Option<String>>,
  io_callback: IoCallback,
  entry_slot: Arc<EntrySlot>,
  truncated: AtomicBool,
  writer_load_state: Mutex<LoadState>,
}

impl Transaction {
  pub(crate) fn new(
    id: u64,
    mode: TransactionMode,
    range_support: bool,
    io_callback: IoCallback,
  ) -> Arc<Transaction> {
    Arc::new(Transaction {
      id,
      mode,
      range_support,
      key: Mutex::new(None),
      io_callback,
      entry_slot: Arc::new(EntrySlot::default()),
      truncated: AtomicBool::new(false),
      writer_load_state: Mutex::new(LoadState::Idle),
    })
  }

  #[inline]
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  #[inline]
  pub fn mode(&self) -> TransactionMode {
    self.mode
  }

  /// Whether byte-range support was enabled on the engine that created this
  /// transaction.
  #[inline]
  pub fn range_support(&self) -> bool {
    self.range_support
  }

  /// The cache key bound by the last open/create/doom issued for this
  /// transaction. A restart after `CacheRace` may bind a fresh key.
  pub fn key(&self) -> Option<String> {
    self.key.lock().clone()
  }

  pub(crate) fn bind_key(&self, key: &str) {
    *self.key.lock() = Some(key.to_string());
  }

  /// The entry handle produced by the last successful open/create.
  pub fn new_entry(&self) -> Option<EntryHandle> {
    self.entry_slot.get()
  }

  pub(crate) fn entry_slot(&self) -> Arc<EntrySlot> {
    Arc::clone(&self.entry_slot)
  }

  /// Records that the cached body is truncated. Returns false when the entry
  /// cannot be resumed later, which is the case without range support; the
  /// caller treats that as a failed write.
  pub fn add_truncated_flag(&self) -> bool {
    if !self.range_support {
      return false;
    }
    self.truncated.store(true, Ordering::Relaxed);
    true
  }

  pub fn is_truncated(&self) -> bool {
    self.truncated.load(Ordering::Relaxed)
  }

  /// Load state reported to queued transactions waiting behind this writer.
  pub fn set_writer_load_state(&self, state: LoadState) {
    *self.writer_load_state.lock() = state;
  }

  pub fn writer_load_state(&self) -> LoadState {
    *self.writer_load_state.lock()
  }

  pub(crate) fn notify(&self, status: CacheStatus) {
    (self.io_callback)(status);
  }
}

impl std::fmt::Debug for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transaction")
      .field("id", &self.id)
      .field("mode", &self.mode)
      .field("key", &*self.key.lock())
      .finish_non_exhaustive()
  }
}
