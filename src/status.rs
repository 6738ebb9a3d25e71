use std::fmt;

/// Completion code delivered to transactions and backend-operation callbacks.
///
/// The codes are opaque to the engine except for equality; backend failures
/// travel through coordination code verbatim and are remapped for queued
/// followers only by the completion dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
  /// The operation finished successfully.
  Ok,
  /// The operation suspended; a callback will deliver the final status.
  IoPending,
  /// The backend has no entry for the requested key.
  NotFound,
  /// Generic failure, including engine unavailability (no backend and no
  /// factory left to build one).
  Failed,
  /// Ordering made the request unserviceable; the transaction must restart
  /// the whole open/create cycle.
  CacheRace,
  /// A second create lost against one that already succeeded for the key.
  CacheCreateFailure,
}

impl CacheStatus {
  /// True for `Ok` only; `IoPending` is not a terminal status.
  #[inline]
  pub fn is_ok(self) -> bool {
    self == CacheStatus::Ok
  }
}

impl fmt::Display for CacheStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CacheStatus::Ok => "ok",
      CacheStatus::IoPending => "io pending",
      CacheStatus::NotFound => "not found",
      CacheStatus::Failed => "failed",
      CacheStatus::CacheRace => "cache race",
      CacheStatus::CacheCreateFailure => "cache create failure",
    };
    f.write_str(name)
  }
}

/// Progress report for a transaction that has not been admitted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
  Idle,
  WaitingForCache,
  SendingRequest,
  ReadingResponse,
}
