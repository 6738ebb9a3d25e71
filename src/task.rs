use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Deferred-task FIFO standing in for the I/O message loop.
///
/// Work posted here runs after the current call stack unwinds: the queue is
/// drained at the tail of every public entry point and completion delivery.
/// A drain already in progress absorbs tasks posted from inside a task, so
/// nesting never happens and per-entry coalescing flags stay accurate.
pub(crate) struct TaskQueue {
  queue: Mutex<VecDeque<Task>>,
  draining: AtomicBool,
}

impl TaskQueue {
  pub(crate) fn new() -> TaskQueue {
    TaskQueue {
      queue: Mutex::new(VecDeque::new()),
      draining: AtomicBool::new(false),
    }
  }

  pub(crate) fn post(&self, task: Task) {
    self.queue.lock().push_back(task);
  }

  pub(crate) fn drain(&self) {
    if self.draining.swap(true, Ordering::Acquire) {
      return;
    }
    loop {
      let task = self.queue.lock().pop_front();
      match task {
        Some(task) => task(),
        None => break,
      }
    }
    self.draining.store(false, Ordering::Release);
  }
}
