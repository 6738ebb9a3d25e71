use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::BackendEntry;
use crate::transaction::Transaction;

/// Stable arena index of an active entry.
///
/// Transactions hold handles rather than references; every use goes back
/// through the engine's arena, so a destroyed entry is detected at lookup
/// instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub(crate) u64);

/// A cache entry currently referenced by at least one transaction or queued
/// for reference.
pub(crate) struct ActiveEntry {
  /// Owned for the entry's whole lifetime; dropping it is the single close.
  pub(crate) backend_entry: Box<dyn BackendEntry>,
  pub(crate) writer: Option<Arc<Transaction>>,
  pub(crate) readers: Vec<Arc<Transaction>>,
  pub(crate) pending: VecDeque<Arc<Transaction>>,
  /// Debounces pending-queue drains: set while a drain is scheduled, which
  /// also keeps the entry alive until the drain runs.
  pub(crate) will_process_pending: bool,
  pub(crate) doomed: bool,
}

impl ActiveEntry {
  pub(crate) fn new(backend_entry: Box<dyn BackendEntry>) -> ActiveEntry {
    ActiveEntry {
      backend_entry,
      writer: None,
      readers: Vec::new(),
      pending: VecDeque::new(),
      will_process_pending: false,
      doomed: false,
    }
  }

  pub(crate) fn writer_is(&self, trans: &Transaction) -> bool {
    self.writer.as_ref().map_or(false, |w| w.id() == trans.id())
  }

  /// Removes `trans` from the readers list. Returns false if it was not a
  /// reader.
  pub(crate) fn remove_reader(&mut self, trans: &Transaction) -> bool {
    match self.readers.iter().position(|r| r.id() == trans.id()) {
      Some(index) => {
        self.readers.remove(index);
        true
      }
      None => false,
    }
  }

  /// Removes `trans` from the pending queue. Returns false if it was not
  /// queued.
  pub(crate) fn remove_pending(&mut self, trans: &Transaction) -> bool {
    match self.pending.iter().position(|t| t.id() == trans.id()) {
      Some(index) => {
        self.pending.remove(index);
        true
      }
      None => false,
    }
  }
}

/// Point-in-time view of one active entry, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
  pub has_writer: bool,
  pub reader_count: usize,
  pub pending_count: usize,
  pub doomed: bool,
}

impl ActiveEntry {
  pub(crate) fn stats(&self) -> EntryStats {
    EntryStats {
      has_writer: self.writer.is_some(),
      reader_count: self.readers.len(),
      pending_count: self.pending.len(),
      doomed: self.doomed,
    }
  }
}
