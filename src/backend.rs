use std::time::SystemTime;

use crate::status::CacheStatus;

/// Callback handed to a [`Backend`] method that suspends. Invoked exactly once
/// with the final status and, on success of an open/create, the entry handle.
///
/// Completions must be delivered on the engine thread. A backend that finishes
/// synchronously returns [`BackendOp::Done`] and drops the callback unused.
pub type BackendCompletion = Box<dyn FnOnce(CacheStatus, Option<Box<dyn BackendEntry>>) + Send>;

/// Callback handed to a [`BackendFactory`] that suspends. Same contract as
/// [`BackendCompletion`], carrying the freshly built backend on success.
pub type FactoryCompletion = Box<dyn FnOnce(CacheStatus, Option<Box<dyn Backend>>) + Send>;

/// Outcome of starting a backend operation.
pub enum BackendOp {
  /// The operation finished synchronously. The provided completion callback
  /// must not be invoked.
  Done(CacheStatus, Option<Box<dyn BackendEntry>>),
  /// The operation suspended; the completion callback fires later.
  Pending,
}

/// Outcome of starting backend construction.
pub enum FactoryOp {
  Done(CacheStatus, Option<Box<dyn Backend>>),
  Pending,
}

/// Produces a [`Backend`] asynchronously. Owned by the engine until the first
/// construction attempt completes, then dropped.
pub trait BackendFactory: Send {
  fn create(&mut self, completion: FactoryCompletion) -> FactoryOp;
}

/// The persistence layer. The engine funnels every entry operation through the
/// pending-op pipeline, so a backend never sees two inflight calls for one
/// key.
///
/// Implementations must not call back into the engine from inside these
/// methods; asynchronous completions are marshaled to the engine thread.
pub trait Backend: Send {
  fn open_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp;
  fn create_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp;
  fn doom_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp;
}

/// A single stored entry. Closing is dropping the box; the engine guarantees
/// that happens exactly once, either when the owning active entry is
/// destroyed or on the dispatcher's cancellation path.
pub trait BackendEntry: Send {
  /// The entry's cache key. May return an empty string for degraded entries;
  /// the engine falls back to a linear scan when deactivating those.
  fn key(&self) -> String;

  /// Marks the entry for destruction once every holder is done with it.
  fn doom(&self);

  /// Timestamp recorded when the cached response was written, if any. Used
  /// only by the metadata writer for bit-for-bit verification.
  fn response_time(&self) -> Option<SystemTime> {
    None
  }

  /// Attaches an opaque metadata blob to the entry.
  fn write_metadata(&self, _buf: &[u8]) -> CacheStatus {
    CacheStatus::Failed
  }
}
