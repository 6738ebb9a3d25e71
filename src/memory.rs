use std::sync::Arc;
use std::time::SystemTime;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use crate::backend::{
  Backend, BackendCompletion, BackendEntry, BackendFactory, BackendOp, FactoryCompletion,
  FactoryOp,
};
use crate::status::CacheStatus;

// Coarse stand-in for per-entry storage cost when mapping max_bytes to an
// entry budget.
const APPROX_ENTRY_BYTES: u64 = 4096;

struct StoredEntry {
  doomed: bool,
  response_time: Option<SystemTime>,
  metadata: Vec<u8>,
}

type SharedEntry = Arc<Mutex<StoredEntry>>;

/// A synchronous in-memory backend. This is the default-factory target for
/// the `Memory` cache type and the crate's reference backend; real disk
/// storage is an external collaborator.
///
/// Clones share the same store.
#[derive(Clone)]
pub struct MemoryBackend {
  entries: Arc<Mutex<HashMap<String, SharedEntry>>>,
  max_entries: Option<usize>,
}

impl MemoryBackend {
  /// `max_bytes == 0` means unbounded. The bound is coarse: it caps the
  /// number of live entries, not their actual payload size.
  pub fn new(max_bytes: u64) -> MemoryBackend {
    let max_entries = if max_bytes == 0 {
      None
    } else {
      Some((max_bytes / APPROX_ENTRY_BYTES).max(1) as usize)
    };
    MemoryBackend {
      entries: Arc::new(Mutex::new(HashMap::new())),
      max_entries,
    }
  }

  /// Records the response timestamp for an existing entry, as the HTTP layer
  /// does when it commits a response. Returns false if the entry is gone.
  pub fn set_response_time(&self, key: &str, time: SystemTime) -> bool {
    match self.entries.lock().get(key) {
      Some(entry) => {
        entry.lock().response_time = Some(time);
        true
      }
      None => false,
    }
  }

  /// The metadata blob currently attached to an entry.
  pub fn metadata(&self, key: &str) -> Option<Vec<u8>> {
    let entries = self.entries.lock();
    let entry = entries.get(key)?;
    let entry = entry.lock();
    if entry.metadata.is_empty() {
      None
    } else {
      Some(entry.metadata.clone())
    }
  }

  pub fn entry_count(&self) -> usize {
    self.entries.lock().len()
  }
}

struct MemoryEntry {
  key: String,
  state: SharedEntry,
}

impl BackendEntry for MemoryEntry {
  fn key(&self) -> String {
    self.key.clone()
  }

  fn doom(&self) {
    self.state.lock().doomed = true;
  }

  fn response_time(&self) -> Option<SystemTime> {
    self.state.lock().response_time
  }

  fn write_metadata(&self, buf: &[u8]) -> CacheStatus {
    self.state.lock().metadata = buf.to_vec();
    CacheStatus::Ok
  }
}

impl Backend for MemoryBackend {
  fn open_entry(&self, key: &str, _completion: BackendCompletion) -> BackendOp {
    let entries = self.entries.lock();
    match entries.get(key) {
      Some(state) if !state.lock().doomed => BackendOp::Done(
        CacheStatus::Ok,
        Some(Box::new(MemoryEntry {
          key: key.to_string(),
          state: Arc::clone(state),
        })),
      ),
      _ => BackendOp::Done(CacheStatus::NotFound, None),
    }
  }

  fn create_entry(&self, key: &str, _completion: BackendCompletion) -> BackendOp {
    let mut entries = self.entries.lock();
    if let Some(existing) = entries.get(key) {
      if !existing.lock().doomed {
        return BackendOp::Done(CacheStatus::Failed, None);
      }
      // A doomed entry no longer owns its key; replace it.
      entries.remove(key);
    }
    if let Some(max) = self.max_entries {
      if entries.len() >= max {
        return BackendOp::Done(CacheStatus::Failed, None);
      }
    }
    let state: SharedEntry = Arc::new(Mutex::new(StoredEntry {
      doomed: false,
      response_time: None,
      metadata: Vec::new(),
    }));
    entries.insert(key.to_string(), Arc::clone(&state));
    BackendOp::Done(
      CacheStatus::Ok,
      Some(Box::new(MemoryEntry {
        key: key.to_string(),
        state,
      })),
    )
  }

  fn doom_entry(&self, key: &str, _completion: BackendCompletion) -> BackendOp {
    match self.entries.lock().remove(key) {
      Some(state) => {
        state.lock().doomed = true;
        BackendOp::Done(CacheStatus::Ok, None)
      }
      None => BackendOp::Done(CacheStatus::NotFound, None),
    }
  }
}

/// Factory producing a [`MemoryBackend`] synchronously.
pub struct MemoryBackendFactory {
  backend: MemoryBackend,
}

impl MemoryBackendFactory {
  pub fn new(max_bytes: u64) -> MemoryBackendFactory {
    MemoryBackendFactory {
      backend: MemoryBackend::new(max_bytes),
    }
  }

  /// A clone sharing the store with whatever the factory produces. Lets the
  /// HTTP layer keep a handle for seeding and inspection.
  pub fn backend(&self) -> MemoryBackend {
    self.backend.clone()
  }
}

impl BackendFactory for MemoryBackendFactory {
  fn create(&mut self, _completion: FactoryCompletion) -> FactoryOp {
    FactoryOp::Done(CacheStatus::Ok, Some(Box::new(self.backend.clone())))
  }
}
