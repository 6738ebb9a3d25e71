//! The detached metadata writer: a self-removing driver that opens a cached
//! entry, verifies the recorded response time bit-for-bit, writes an opaque
//! blob, and disappears. Every failure along the way is silent.

use std::sync::Arc;
use std::time::SystemTime;

use url::Url;

use crate::key::RequestInfo;
use crate::metrics::Metrics;
use crate::shared::EngineShared;
use crate::status::CacheStatus;
use crate::transaction::{Transaction, TransactionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterPhase {
  /// Waiting for the open to complete.
  Opening,
  /// Waiting for admission to the entry.
  Admitting,
}

pub(crate) struct MetadataWriter {
  trans: Arc<Transaction>,
  expected_response_time: SystemTime,
  buf: Vec<u8>,
  phase: WriterPhase,
}

enum Step {
  Admit(Arc<Transaction>),
  Verify(Arc<Transaction>),
  Destroy,
}

impl EngineShared {
  pub(crate) fn write_metadata(&self, url: &Url, expected_response_time: SystemTime, buf: &[u8]) {
    self.assert_engine_thread();
    if buf.is_empty() {
      return;
    }

    // Lazy backend initialization, result discarded.
    if self.state.lock().backend.is_none() {
      let _ = self.create_backend(None);
    }

    let key = self.generate_cache_key(&RequestInfo::get(url.clone()));
    let (id, trans) = {
      let mut state = self.state.lock();
      let id = state.next_writer_id;
      state.next_writer_id += 1;
      let transaction_id = state.next_transaction_id;
      state.next_transaction_id += 1;
      let weak = self.weak_self.clone();
      let trans = Transaction::new(
        transaction_id,
        TransactionMode::READ,
        self.range_support,
        Box::new(move |status| {
          if let Some(shared) = weak.upgrade() {
            shared.metadata_io_complete(id, status);
            shared.tasks.drain();
          }
        }),
      );
      state.metadata_writers.insert(
        id,
        MetadataWriter {
          trans: Arc::clone(&trans),
          expected_response_time,
          buf: buf.to_vec(),
          phase: WriterPhase::Opening,
        },
      );
      (id, trans)
    };

    let rv = self.open_entry(&key, &trans);
    if rv != CacheStatus::IoPending {
      self.metadata_io_complete(id, rv);
    }
    self.tasks.drain();
  }

  fn metadata_io_complete(&self, id: u64, status: CacheStatus) {
    self.assert_engine_thread();
    let step = {
      let mut state = self.state.lock();
      let Some(writer) = state.metadata_writers.get_mut(&id) else {
        return;
      };
      match writer.phase {
        WriterPhase::Opening => {
          if status != CacheStatus::Ok || writer.trans.new_entry().is_none() {
            Step::Destroy
          } else {
            writer.phase = WriterPhase::Admitting;
            Step::Admit(Arc::clone(&writer.trans))
          }
        }
        WriterPhase::Admitting => {
          if status != CacheStatus::Ok {
            Step::Destroy
          } else {
            Step::Verify(Arc::clone(&writer.trans))
          }
        }
      }
    };

    match step {
      Step::Admit(trans) => {
        let handle = trans.new_entry().unwrap();
        let rv = self.add_transaction_to_entry(handle, &trans);
        if rv != CacheStatus::IoPending {
          self.metadata_io_complete(id, rv);
        }
      }
      Step::Verify(trans) => {
        let handle = trans.new_entry();
        let wrote = {
          let state = self.state.lock();
          let writer = state.metadata_writers.get(&id).expect("verifying a removed writer");
          handle
            .and_then(|h| state.entries.get(&h))
            .map_or(false, |entry| {
              match entry.backend_entry.response_time() {
                // The comparison is exact; a cached response from any other
                // point in time must not accept this metadata.
                Some(time) if time == writer.expected_response_time => {
                  entry.backend_entry.write_metadata(&writer.buf) == CacheStatus::Ok
                }
                _ => false,
              }
            })
        };
        if wrote {
          Metrics::bump(&self.metrics.metadata_writes);
        }
        if let Some(handle) = handle {
          self.done_with_entry(handle, &trans, false);
        }
        self.destroy_metadata_writer(id);
      }
      Step::Destroy => self.destroy_metadata_writer(id),
    }
  }

  fn destroy_metadata_writer(&self, id: u64) {
    self.state.lock().metadata_writers.remove(&id);
  }
}
