//! Wait queues — block a task until another task wakes it.
//!
//! The protocol is always the same three steps:
//!   1. `prepare()` — enqueue an entry for the current task, while still
//!      holding whatever lock protects the condition being waited for
//!   2. drop that lock, `sleep()` on the entry
//!   3. `finish()` — dequeue the entry (no-op if a waker already did)
//!
//! Because the entry is queued before the condition lock is released, a
//! waker that changes the condition afterwards always finds it.  Wakeups
//! are sticky (`woken` flag + thread unpark), so one delivered between
//! steps 1 and 2 is not lost either.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::task::{self, Task};

/// Whether a pending task signal aborts the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
	/// Return `Error::Interrupted` as soon as a signal is pending.
	Interruptible,
	/// Sleep through signals.
	Uninterruptible,
}

// ── Wait entry ──────────────────────────────────────────────────

/// One sleeping task.
pub struct WaitEntry {
	task: Task,
	woken: AtomicBool,
}

impl WaitEntry {
	/// Create an entry for the calling thread.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			task: task::current(),
			woken: AtomicBool::new(false),
		})
	}

	/// Mark the entry woken and unpark its task.
	pub fn wake(&self) {
		self.woken.store(true, Ordering::Release);
		self.task.wake();
	}

	pub fn is_woken(&self) -> bool {
		self.woken.load(Ordering::Acquire)
	}

	/// Sleep until woken, interrupted (if `mode` allows) or `deadline`.
	///
	/// Must be called by the task that created the entry.  A wake always
	/// wins over a signal or a deadline that arrive at the same time.
	pub fn sleep(&self, mode: WaitMode, deadline: Option<Instant>) -> Result {
		debug_assert!(self.task.is_current(), "sleeping on another task's entry");

		loop {
			if self.is_woken() {
				return Ok(());
			}
			if mode == WaitMode::Interruptible && self.task.signal_pending() {
				return Err(Error::Interrupted);
			}
			match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Err(Error::TimedOut);
					}
					thread::park_timeout(deadline - now);
				}
				None => thread::park(),
			}
		}
	}
}

// ── Wait queue ──────────────────────────────────────────────────

/// A list of sleeping tasks, woken all at once.
pub struct WaitQueue {
	waiters: Mutex<Vec<Arc<WaitEntry>>>,
}

impl WaitQueue {
	pub const fn new() -> Self {
		Self {
			waiters: Mutex::new(Vec::new()),
		}
	}

	/// Enqueue the calling task.
	pub fn prepare(&self) -> Arc<WaitEntry> {
		let entry = WaitEntry::new();
		self.waiters.lock().push(entry.clone());
		entry
	}

	/// Dequeue `entry` if a waker has not already done so.
	pub fn finish(&self, entry: &Arc<WaitEntry>) {
		self.waiters.lock().retain(|e| !Arc::ptr_eq(e, entry));
	}

	/// Wake every queued task.  Returns how many were woken.
	pub fn wake_all(&self) -> usize {
		let woken = core::mem::take(&mut *self.waiters.lock());
		for entry in &woken {
			entry.wake();
		}
		woken.len()
	}

	pub fn is_empty(&self) -> bool {
		self.waiters.lock().is_empty()
	}
}

impl Default for WaitQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;
	use std::time::Duration;

	#[test]
	fn wake_before_sleep_is_not_lost() {
		let queue = WaitQueue::new();
		let entry = queue.prepare();
		assert_eq!(queue.wake_all(), 1);
		assert!(queue.is_empty());
		assert_eq!(entry.sleep(WaitMode::Uninterruptible, None), Ok(()));
	}

	#[test]
	fn sleep_times_out() {
		let queue = WaitQueue::new();
		let entry = queue.prepare();
		let deadline = Instant::now() + Duration::from_millis(20);
		assert_eq!(entry.sleep(WaitMode::Interruptible, Some(deadline)), Err(Error::TimedOut));
		queue.finish(&entry);
		assert!(queue.is_empty());
	}

	#[test]
	fn wake_from_other_thread() {
		let queue = Arc::new(WaitQueue::new());
		let (tx, rx) = mpsc::channel();
		let q = queue.clone();
		let sleeper = thread::spawn(move || {
			let entry = q.prepare();
			tx.send(()).unwrap();
			let res = entry.sleep(WaitMode::Uninterruptible, None);
			q.finish(&entry);
			res
		});

		rx.recv().unwrap();
		while queue.wake_all() == 0 {
			thread::yield_now();
		}
		assert_eq!(sleeper.join().unwrap(), Ok(()));
	}

	#[test]
	fn signal_interrupts_only_interruptible_sleep() {
		let (tx, rx) = mpsc::channel();
		let sleeper = thread::spawn(move || {
			let queue = WaitQueue::new();
			let entry = queue.prepare();
			tx.send(task::current()).unwrap();
			let interrupted = entry.sleep(WaitMode::Interruptible, None);

			let deadline = Instant::now() + Duration::from_millis(30);
			let ignored = entry.sleep(WaitMode::Uninterruptible, Some(deadline));
			task::current().clear_signal();
			(interrupted, ignored)
		});

		rx.recv().unwrap().send_signal();
		let (interrupted, ignored) = sleeper.join().unwrap();
		assert_eq!(interrupted, Err(Error::Interrupted));
		assert_eq!(ignored, Err(Error::TimedOut));
	}
}
