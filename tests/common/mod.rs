#![allow(dead_code)] // not every test binary uses every helper

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft_cache::{
  Backend, BackendCompletion, BackendEntry, BackendFactory, BackendOp, CacheEngine, CacheStatus,
  EngineBuilder, FactoryCompletion, FactoryOp, IoCallback,
};

/// Observability handles for one backend entry produced by the mock.
#[derive(Clone)]
pub struct EntryProbe {
  pub doomed: Arc<AtomicBool>,
  pub closes: Arc<AtomicUsize>,
}

impl EntryProbe {
  pub fn is_doomed(&self) -> bool {
    self.doomed.load(Ordering::SeqCst)
  }

  pub fn close_count(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }
}

struct MockEntry {
  key: String,
  doomed: Arc<AtomicBool>,
  closes: Arc<AtomicUsize>,
}

impl BackendEntry for MockEntry {
  fn key(&self) -> String {
    self.key.clone()
  }

  fn doom(&self) {
    self.doomed.store(true, Ordering::SeqCst);
  }
}

impl Drop for MockEntry {
  fn drop(&mut self) {
    self.closes.fetch_add(1, Ordering::SeqCst);
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
  Open(String),
  Create(String),
  Doom(String),
}

impl MockOp {
  fn key(&self) -> &str {
    match self {
      MockOp::Open(k) | MockOp::Create(k) | MockOp::Doom(k) => k,
    }
  }
}

/// Shared control block for the mock backend and factory. By default every
/// operation completes synchronously against an in-memory key set; tests
/// that need to interleave completions switch to hold mode and release the
/// held completions one by one.
pub struct MockControl {
  hold_ops: AtomicBool,
  hold_factory: AtomicBool,
  entries: Mutex<HashSet<String>>,
  held: Mutex<VecDeque<(MockOp, BackendCompletion)>>,
  held_factory: Mutex<Option<FactoryCompletion>>,
  pub calls: Mutex<Vec<MockOp>>,
  factory_calls: AtomicUsize,
  probes: Mutex<Vec<(String, EntryProbe)>>,
}

impl MockControl {
  pub fn new() -> MockControl {
    MockControl {
      hold_ops: AtomicBool::new(false),
      hold_factory: AtomicBool::new(false),
      entries: Mutex::new(HashSet::new()),
      held: Mutex::new(VecDeque::new()),
      held_factory: Mutex::new(None),
      calls: Mutex::new(Vec::new()),
      factory_calls: AtomicUsize::new(0),
      probes: Mutex::new(Vec::new()),
    }
  }

  /// Make entry operations suspend until `complete_next*` is called.
  pub fn hold_entry_ops(&self) {
    self.hold_ops.store(true, Ordering::SeqCst);
  }

  /// Make backend construction suspend until `complete_backend` is called.
  pub fn hold_backend_creation(&self) {
    self.hold_factory.store(true, Ordering::SeqCst);
  }

  /// Pre-populate the synchronous store with an existing entry.
  pub fn seed(&self, key: &str) {
    self.entries.lock().unwrap().insert(key.to_string());
  }

  pub fn held_count(&self) -> usize {
    self.held.lock().unwrap().len()
  }

  pub fn factory_calls(&self) -> usize {
    self.factory_calls.load(Ordering::SeqCst)
  }

  /// The probe for the most recent entry handed out under `key`.
  pub fn probe_for(&self, key: &str) -> EntryProbe {
    self
      .probes
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find(|(k, _)| k == key)
      .map(|(_, p)| p.clone())
      .expect("no entry was produced for this key")
  }

  fn make_entry(&self, key: &str) -> Box<dyn BackendEntry> {
    let probe = EntryProbe {
      doomed: Arc::new(AtomicBool::new(false)),
      closes: Arc::new(AtomicUsize::new(0)),
    };
    self
      .probes
      .lock()
      .unwrap()
      .push((key.to_string(), probe.clone()));
    Box::new(MockEntry {
      key: key.to_string(),
      doomed: probe.doomed,
      closes: probe.closes,
    })
  }

  /// Completes the oldest held operation successfully, producing an entry
  /// for opens and creates. Returns the probe for that entry, if any.
  pub fn complete_next_ok(&self) -> Option<EntryProbe> {
    let (op, completion) = self
      .held
      .lock()
      .unwrap()
      .pop_front()
      .expect("no held backend operation");
    let entry = match &op {
      MockOp::Open(key) => Some(self.make_entry(key)),
      MockOp::Create(key) => {
        self.entries.lock().unwrap().insert(key.clone());
        Some(self.make_entry(key))
      }
      MockOp::Doom(key) => {
        self.entries.lock().unwrap().remove(key);
        None
      }
    };
    let probe = entry.as_ref().map(|_| self.probe_for(op.key()));
    completion(CacheStatus::Ok, entry);
    probe
  }

  /// Completes the oldest held operation with a failure status.
  pub fn complete_next(&self, status: CacheStatus) {
    assert!(status != CacheStatus::Ok, "use complete_next_ok for success");
    let (_, completion) = self
      .held
      .lock()
      .unwrap()
      .pop_front()
      .expect("no held backend operation");
    completion(status, None);
  }
}

pub struct MockBackend {
  ctl: Arc<MockControl>,
}

impl MockBackend {
  fn start(&self, op: MockOp, completion: BackendCompletion) -> BackendOp {
    self.ctl.calls.lock().unwrap().push(op.clone());
    if self.ctl.hold_ops.load(Ordering::SeqCst) {
      self.ctl.held.lock().unwrap().push_back((op, completion));
      return BackendOp::Pending;
    }
    let mut entries = self.ctl.entries.lock().unwrap();
    match op {
      MockOp::Open(key) => {
        if entries.contains(&key) {
          drop(entries);
          BackendOp::Done(CacheStatus::Ok, Some(self.ctl.make_entry(&key)))
        } else {
          BackendOp::Done(CacheStatus::NotFound, None)
        }
      }
      MockOp::Create(key) => {
        if entries.contains(&key) {
          return BackendOp::Done(CacheStatus::Failed, None);
        }
        entries.insert(key.clone());
        drop(entries);
        BackendOp::Done(CacheStatus::Ok, Some(self.ctl.make_entry(&key)))
      }
      MockOp::Doom(key) => {
        if entries.remove(&key) {
          BackendOp::Done(CacheStatus::Ok, None)
        } else {
          BackendOp::Done(CacheStatus::NotFound, None)
        }
      }
    }
  }
}

impl Backend for MockBackend {
  fn open_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp {
    self.start(MockOp::Open(key.to_string()), completion)
  }

  fn create_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp {
    self.start(MockOp::Create(key.to_string()), completion)
  }

  fn doom_entry(&self, key: &str, completion: BackendCompletion) -> BackendOp {
    self.start(MockOp::Doom(key.to_string()), completion)
  }
}

pub struct MockFactory {
  ctl: Arc<MockControl>,
}

impl MockFactory {
  pub fn new(ctl: Arc<MockControl>) -> MockFactory {
    MockFactory { ctl }
  }
}

impl BackendFactory for MockFactory {
  fn create(&mut self, completion: FactoryCompletion) -> FactoryOp {
    self.ctl.factory_calls.fetch_add(1, Ordering::SeqCst);
    if self.ctl.hold_factory.load(Ordering::SeqCst) {
      *self.ctl.held_factory.lock().unwrap() = Some(completion);
      return FactoryOp::Pending;
    }
    FactoryOp::Done(
      CacheStatus::Ok,
      Some(Box::new(MockBackend {
        ctl: Arc::clone(&self.ctl),
      })),
    )
  }
}

/// Releases a held backend construction with `status`.
pub fn complete_backend(ctl: &Arc<MockControl>, status: CacheStatus) {
  let completion = ctl
    .held_factory
    .lock()
    .unwrap()
    .take()
    .expect("no held backend construction");
  let backend: Option<Box<dyn Backend>> = if status == CacheStatus::Ok {
    Some(Box::new(MockBackend {
      ctl: Arc::clone(ctl),
    }))
  } else {
    None
  };
  completion(status, backend);
}

/// An engine wired to a fresh mock backend.
pub fn mock_engine() -> (CacheEngine, Arc<MockControl>) {
  let ctl = Arc::new(MockControl::new());
  let engine = EngineBuilder::new()
    .backend_factory(MockFactory::new(Arc::clone(&ctl)))
    .build();
  (engine, ctl)
}

pub type EventLog = Arc<Mutex<Vec<(&'static str, CacheStatus)>>>;

pub fn event_log() -> EventLog {
  Arc::new(Mutex::new(Vec::new()))
}

/// An io callback that appends `(name, status)` to the shared log.
pub fn recorder(log: &EventLog, name: &'static str) -> IoCallback {
  let log = Arc::clone(log);
  Box::new(move |status| log.lock().unwrap().push((name, status)))
}

pub fn events(log: &EventLog) -> Vec<(&'static str, CacheStatus)> {
  log.lock().unwrap().clone()
}
