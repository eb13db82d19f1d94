//! Tasks — the execution contexts that block in fence and reservation waits.
//!
//! Every thread that touches the crate gets a [`Task`] the first time it
//! asks for [`current()`].  A task carries a pending-signal flag: another
//! thread may call [`Task::send_signal`] to ask it to abandon whatever
//! interruptible wait it is in (or enters next).  Uninterruptible waits
//! ignore the flag, exactly like a task in `TASK_UNINTERRUPTIBLE`.
//!
//! Blocking is done by parking the thread; waking is `unpark`.  Unpark
//! before park is remembered by the thread, so a wake that races ahead of
//! the sleep is never lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

// ── Task identifiers ────────────────────────────────────────────

/// Monotonically increasing task id counter.
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique task id.
fn alloc_tid() -> u64 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

// ── Task ────────────────────────────────────────────────────────

struct TaskInner {
    tid: u64,
    thread: Thread,
    sigpending: AtomicBool,
}

/// Handle to one thread's task state.  Cheap to clone and to send to the
/// thread that will interrupt it.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

thread_local! {
    static CURRENT: Task = Task::new(thread::current());
}

/// The calling thread's task.
pub fn current() -> Task {
    CURRENT.with(Task::clone)
}

impl Task {
    fn new(thread: Thread) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                tid: alloc_tid(),
                thread,
                sigpending: AtomicBool::new(false),
            }),
        }
    }

    /// Unique task id (never reused within a process).
    pub fn tid(&self) -> u64 {
        self.inner.tid
    }

    /// Mark a signal pending and kick the task out of any sleep.
    ///
    /// The signal stays pending until the task consumes it with
    /// [`clear_signal`](Self::clear_signal); every interruptible wait
    /// entered meanwhile fails with `Error::Interrupted`.
    pub fn send_signal(&self) {
        self.inner.sigpending.store(true, Ordering::Release);
        self.inner.thread.unpark();
    }

    pub fn signal_pending(&self) -> bool {
        self.inner.sigpending.load(Ordering::Acquire)
    }

    /// Consume the pending signal.  Returns whether one was pending.
    pub fn clear_signal(&self) -> bool {
        self.inner.sigpending.swap(false, Ordering::AcqRel)
    }

    /// Wake the task if it is parked.
    pub(crate) fn wake(&self) {
        self.inner.thread.unpark();
    }

    pub fn is_current(&self) -> bool {
        self.inner.thread.id() == thread::current().id()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.inner.tid)
            .field("sigpending", &self.signal_pending())
            .finish()
    }
}
