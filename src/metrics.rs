use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Internal counters for the coordination engine. All fields are atomic so
/// snapshots never block an operation.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
  // --- Fast path / coalescing ---
  pub(crate) fast_path_hits: CachePadded<AtomicU64>,
  pub(crate) backend_joins: CachePadded<AtomicU64>,

  // --- Entry lifecycle ---
  pub(crate) entries_activated: CachePadded<AtomicU64>,
  pub(crate) entries_deactivated: CachePadded<AtomicU64>,
  pub(crate) entries_doomed: CachePadded<AtomicU64>,
  pub(crate) slow_deactivations: CachePadded<AtomicU64>,

  // --- Arbitration ---
  pub(crate) pending_admissions: CachePadded<AtomicU64>,
  pub(crate) races_signaled: CachePadded<AtomicU64>,
  pub(crate) create_collisions: CachePadded<AtomicU64>,

  // --- Metadata writer ---
  pub(crate) metadata_writes: CachePadded<AtomicU64>,
}

impl Metrics {
  pub(crate) fn new() -> Metrics {
    Metrics::default()
  }

  #[inline]
  pub(crate) fn bump(counter: &CachePadded<AtomicU64>) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
      backend_joins: self.backend_joins.load(Ordering::Relaxed),
      entries_activated: self.entries_activated.load(Ordering::Relaxed),
      entries_deactivated: self.entries_deactivated.load(Ordering::Relaxed),
      entries_doomed: self.entries_doomed.load(Ordering::Relaxed),
      slow_deactivations: self.slow_deactivations.load(Ordering::Relaxed),
      pending_admissions: self.pending_admissions.load(Ordering::Relaxed),
      races_signaled: self.races_signaled.load(Ordering::Relaxed),
      create_collisions: self.create_collisions.load(Ordering::Relaxed),
      metadata_writes: self.metadata_writes.load(Ordering::Relaxed),
    }
  }
}

/// A point-in-time, public snapshot of the engine's counters.
#[derive(Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
  /// Opens served directly from the active-entry map.
  pub fast_path_hits: u64,
  /// Requests that joined an inflight backend construction or operation.
  pub backend_joins: u64,
  /// Entries activated after a successful backend open/create.
  pub entries_activated: u64,
  /// Entries deactivated after their last holder finished.
  pub entries_deactivated: u64,
  /// Entries removed from the lookup map by dooming.
  pub entries_doomed: u64,
  /// Deactivations that had to fall back to a linear scan because the
  /// backend entry reported an empty key.
  pub slow_deactivations: u64,
  /// Admissions that had to queue behind a writer or an earlier waiter.
  pub pending_admissions: u64,
  /// `CacheRace` notifications delivered.
  pub races_signaled: u64,
  /// `CacheCreateFailure` notifications delivered.
  pub create_collisions: u64,
  /// Metadata blobs written by the detached writer.
  pub metadata_writes: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("fast_path_hits", &self.fast_path_hits)
      .field("backend_joins", &self.backend_joins)
      .field("entries_activated", &self.entries_activated)
      .field("entries_deactivated", &self.entries_deactivated)
      .field("entries_doomed", &self.entries_doomed)
      .field("slow_deactivations", &self.slow_deactivations)
      .field("pending_admissions", &self.pending_admissions)
      .field("races_signaled", &self.races_signaled)
      .field("create_collisions", &self.create_collisions)
      .field("metadata_writes", &self.metadata_writes)
      .finish()
  }
}
