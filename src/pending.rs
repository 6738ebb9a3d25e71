use std::collections::VecDeque;
use std::sync::Arc;

use crate::entry::EntryHandle;
use crate::status::CacheStatus;
use crate::transaction::{EntrySlot, Transaction};

/// The kind of backend request a work item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItemKind {
  CreateBackend,
  OpenEntry,
  CreateEntry,
  DoomEntry,
}

/// Completion sink for callers of `get_backend`.
pub(crate) type UserCallback = Box<dyn FnOnce(CacheStatus) + Send>;

/// One pending backend request together with its result sinks. Cancellation
/// clears individual sinks; an item with no sinks left is a no-op that still
/// drains the queue.
pub(crate) struct WorkItem {
  pub(crate) kind: WorkItemKind,
  transaction: Option<Arc<Transaction>>,
  entry_slot: Option<Arc<EntrySlot>>,
  callback: Option<UserCallback>,
}

impl WorkItem {
  /// Item for an open/create: notifies the transaction and fills its entry
  /// slot.
  pub(crate) fn for_entry(kind: WorkItemKind, trans: &Arc<Transaction>) -> WorkItem {
    WorkItem {
      kind,
      transaction: Some(Arc::clone(trans)),
      entry_slot: Some(trans.entry_slot()),
      callback: None,
    }
  }

  /// Item for a doom: notifies the transaction, produces no entry.
  pub(crate) fn for_doom(trans: &Arc<Transaction>) -> WorkItem {
    WorkItem {
      kind: WorkItemKind::DoomEntry,
      transaction: Some(Arc::clone(trans)),
      entry_slot: None,
      callback: None,
    }
  }

  /// Item for backend construction, with an optional transaction waiting on
  /// the backend and an optional user callback.
  pub(crate) fn for_backend(
    trans: Option<&Arc<Transaction>>,
    callback: Option<UserCallback>,
  ) -> WorkItem {
    WorkItem {
      kind: WorkItemKind::CreateBackend,
      transaction: trans.map(Arc::clone),
      entry_slot: None,
      callback,
    }
  }

  pub(crate) fn matches(&self, trans: &Transaction) -> bool {
    self.transaction.as_ref().map_or(false, |t| t.id() == trans.id())
  }

  pub(crate) fn is_valid(&self) -> bool {
    self.transaction.is_some() || self.entry_slot.is_some() || self.callback.is_some()
  }

  pub(crate) fn has_callback(&self) -> bool {
    self.callback.is_some()
  }

  pub(crate) fn clear_transaction(&mut self) {
    self.transaction = None;
  }

  pub(crate) fn clear_entry_slot(&mut self) {
    self.entry_slot = None;
  }

  pub(crate) fn clear_callback(&mut self) {
    self.callback = None;
  }

  /// Fills the entry slot, then runs the transaction's io callback if the
  /// transaction sink is still attached.
  pub(crate) fn notify(self, status: CacheStatus, entry: Option<EntryHandle>) {
    if let Some(slot) = self.entry_slot {
      slot.set(entry);
    }
    if let Some(trans) = self.transaction {
      trans.notify(status);
    }
  }

  /// Delivers a backend-construction result: the user callback when one is
  /// attached, otherwise the transaction notification path.
  pub(crate) fn deliver_backend(mut self, status: CacheStatus) {
    if let Some(callback) = self.callback.take() {
      callback(status);
    } else {
      self.notify(status, None);
    }
  }
}

/// Per-key serialization point for inflight backend calls. `writer` is set
/// iff a call is inflight; queued items are serviced strictly after it, in
/// FIFO order. Results travel in the completion callback's arguments, so the
/// op itself carries no backend state.
pub(crate) struct PendingOp {
  pub(crate) writer: Option<WorkItem>,
  pub(crate) queue: VecDeque<WorkItem>,
}

impl PendingOp {
  pub(crate) fn new() -> PendingOp {
    PendingOp {
      writer: None,
      queue: VecDeque::new(),
    }
  }
}
