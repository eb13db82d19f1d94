//! Validation lists — reserve many buffers, use them, commit a fence.
//!
//! A producer describes the buffers one submission touches as a list of
//! [`ValidateEntry`]s and drives one cycle through the table:
//!
//!   reserve()            — claim every buffer or none; capture the fences
//!                          the submission must wait behind
//!   wait_completed_cpu() — (optional) wait for those fences on the CPU
//!   fence_and_release()  — attach the submission's fence, drop the claims
//!   backoff()            — or give the claims up without committing
//!
//! DEADLOCK AVOIDANCE:
//!   Two producers reserving overlapping buffers in different orders would
//!   deadlock under plain locking.  Instead every attempt draws a ticket
//!   from the table (lower = older), and on contention:
//!
//! ```text
//!     holder is OLDER   → wait for that one buffer, keep what we hold,
//!                         retry just that buffer.  The older holder never
//!                         waits on us (see next rule), so no cycle.
//!     holder is YOUNGER → waiting could close a cycle.  Release everything
//!                         we hold, wait for the contended buffer, draw a
//!                         NEW ticket and restart from the top of the list.
//! ```
//!
//!   Every wait edge points from a younger ticket to an older one, so the
//!   waits-for graph is acyclic.  The table lock is never held while
//!   sleeping.

use std::hint;
use std::sync::MutexGuard;
use std::thread;
use std::time::Instant;

use log::{debug, error, trace, warn};

use super::{FenceSlots, ReservationTable, TableState};
use crate::buffer::{BufferId, DmaBuf};
use crate::config::{CPU_WAIT_TIMEOUT, MAX_CAPTURED_FENCES};
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::task;
use crate::wait::WaitMode;

/// How a submission uses a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
	/// Read alongside other readers; the fence goes into a shared slot.
	Shared,
	/// Write; the fence replaces everything attached.
	Exclusive,
}

/// One buffer of a validation list.
pub struct ValidateEntry {
	buf: DmaBuf,
	access: Access,
	/// This entry currently holds the buffer's reservation.
	reserved: bool,
	ticket: Option<u64>,
	/// Fences captured at reservation time.
	fences: FenceSlots<MAX_CAPTURED_FENCES>,
}

impl ValidateEntry {
	/// Takes a reference on `buf` for the lifetime of the entry.
	pub fn new(buf: &DmaBuf, access: Access) -> Self {
		Self {
			buf: buf.clone(),
			access,
			reserved: false,
			ticket: None,
			fences: FenceSlots::new(),
		}
	}

	pub fn shared(buf: &DmaBuf) -> Self {
		Self::new(buf, Access::Shared)
	}

	pub fn exclusive(buf: &DmaBuf) -> Self {
		Self::new(buf, Access::Exclusive)
	}

	pub fn buffer(&self) -> &DmaBuf {
		&self.buf
	}

	pub fn access(&self) -> Access {
		self.access
	}

	pub fn is_reserved(&self) -> bool {
		self.reserved
	}

	/// Ticket this entry's reservation was granted under.
	pub fn ticket(&self) -> Option<u64> {
		self.ticket
	}

	/// Fences the submission must wait behind before using the buffer.
	pub fn fences(&self) -> impl Iterator<Item = &Fence> {
		self.fences.iter()
	}

	pub fn num_fences(&self) -> usize {
		self.fences.len()
	}

	fn id(&self) -> BufferId {
		self.buf.id()
	}
}

impl std::fmt::Debug for ValidateEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ValidateEntry")
			.field("buf", &self.buf.id())
			.field("access", &self.access)
			.field("reserved", &self.reserved)
			.field("ticket", &self.ticket)
			.field("fences", &self.fences.len())
			.finish()
	}
}

impl Drop for ValidateEntry {
	fn drop(&mut self) {
		if self.reserved {
			warn!("[resv] entry for buffer {} dropped while reserved", self.buf.id());
			let table = self.buf.table().clone();
			table.backoff(std::slice::from_mut(self));
		}
	}
}

/// Why a buffer could not be reserved right away.
enum Contention {
	/// Held under an older ticket: wait for it, keep our claims.
	HolderOlder,
	/// Held under a younger ticket: back off and restart.
	HolderYounger,
	/// Not contention at all.
	Fatal(Error),
}

impl TableState {
	fn try_reserve(&mut self, id: BufferId, ticket: u64) -> core::result::Result<(), Contention> {
		let resv = self
			.get_mut(id)
			.ok_or(Contention::Fatal(Error::InvalidArgument))?;
		if !resv.reserved {
			resv.reserved = true;
			resv.ticket = Some(ticket);
			return Ok(());
		}
		match resv.ticket {
			Some(holder) if holder == ticket => Err(Contention::Fatal(Error::Deadlock)),
			Some(holder) if holder > ticket => Err(Contention::HolderYounger),
			_ => Err(Contention::HolderOlder),
		}
	}
}

impl ReservationTable {
	/// Reserve every buffer in `list`, or none.
	///
	/// On success returns the ticket the reservations were granted under,
	/// and each entry holds the fences it must wait behind: a shared entry
	/// gets the buffer's exclusive fence, an exclusive entry gets every
	/// attached fence.  Contention is resolved internally; the errors are
	/// `Interrupted` (only in interruptible mode), `SharedSlotsFull`,
	/// `Deadlock` (a buffer listed twice) and `InvalidArgument` (a buffer
	/// from another table).  On error nothing in `list` is reserved.
	pub fn reserve(&self, list: &mut [ValidateEntry], mode: WaitMode) -> Result<u64> {
		if let Some(stranger) = list.iter().find(|e| !ReservationTable::ptr_eq(e.buf.table(), self)) {
			warn!("[resv] buffer {} belongs to another table", stranger.id());
			return Err(Error::InvalidArgument);
		}

		let mut stale = Vec::new();
		let mut state = self.lock();
		// Start from a clean list even if a previous cycle was abandoned.
		self.backoff_locked(&mut state, list, &mut stale);

		let ticket = 'retry: loop {
			let ticket = state.draw_ticket();
			trace!("[resv] ticket {}: reserving {} buffers", ticket, list.len());

			let mut i = 0;
			while i < list.len() {
				let id = list[i].id();
				match state.try_reserve(id, ticket) {
					Ok(()) => {}
					Err(Contention::HolderOlder) => {
						trace!("[resv] ticket {}: buffer {} held by older ticket, waiting", ticket, id);
						let (relocked, res) = self.wait_unreserved(state, id, mode);
						state = relocked;
						if let Err(e) = res {
							self.backoff_locked(&mut state, list, &mut stale);
							drop(state);
							return Err(e);
						}
						continue;
					}
					Err(Contention::HolderYounger) => {
						debug!("[resv] ticket {}: buffer {} held by younger ticket, backing off", ticket, id);
						self.backoff_locked(&mut state, list, &mut stale);
						let (relocked, res) = self.wait_unreserved(state, id, mode);
						state = relocked;
						if let Err(e) = res {
							drop(state);
							return Err(e);
						}
						continue 'retry;
					}
					Err(Contention::Fatal(e)) => {
						warn!("[resv] ticket {}: buffer {}: {}", ticket, id, e);
						self.backoff_locked(&mut state, list, &mut stale);
						drop(state);
						return Err(e);
					}
				}

				list[i].reserved = true;
				list[i].ticket = Some(ticket);

				let full = state.get(id).is_some_and(|r| r.shared.is_full());
				if list[i].access == Access::Shared && full {
					warn!("[resv] buffer {}: all shared fence slots in use", id);
					self.backoff_locked(&mut state, list, &mut stale);
					drop(state);
					return Err(Error::SharedSlotsFull);
				}
				i += 1;
			}
			break ticket;
		};

		for entry in list.iter_mut() {
			let Some(resv) = state.get(entry.id()) else {
				continue;
			};
			let captured = match entry.access {
				Access::Shared => entry.fences.push_all(resv.excl.iter()),
				Access::Exclusive => entry.fences.push_all(resv.shared.iter().chain(resv.excl.iter())),
			};
			debug_assert!(captured.is_ok(), "capture buffer smaller than fence slots");
		}
		drop(state);
		drop(stale);
		Ok(ticket)
	}

	/// Release every reservation held by entries of `list`.
	///
	/// Entries that hold nothing are skipped, so this is safe on a partly
	/// reserved list and a no-op on an unreserved one.
	pub fn backoff(&self, list: &mut [ValidateEntry]) {
		let mut stale = Vec::new();
		let mut state = self.lock();
		self.backoff_locked(&mut state, list, &mut stale);
		drop(state);
		drop(stale);
	}

	/// Commit: attach `fence` to every buffer in `list` and release them.
	///
	/// Exclusive entries replace everything attached to their buffer;
	/// shared entries append to the shared slots and keep the exclusive
	/// fence.  Fails with `NotReserved`, changing nothing, unless every
	/// entry holds its reservation.
	pub fn fence_and_release(&self, fence: &Fence, list: &mut [ValidateEntry]) -> Result {
		let mut stale = Vec::new();
		let mut state = self.lock();

		for entry in list.iter() {
			let held = entry.reserved
				&& ReservationTable::ptr_eq(entry.buf.table(), self)
				&& state
					.get(entry.id())
					.is_some_and(|r| r.reserved && r.ticket == entry.ticket);
			if !held {
				warn!("[resv] commit of fence {} on unreserved buffer {}", fence.id(), entry.id());
				return Err(Error::NotReserved);
			}
		}

		for entry in list.iter_mut() {
			let id = entry.id();
			if let Some(resv) = state.get_mut(id) {
				match entry.access {
					Access::Shared => {
						// Capacity was checked at reserve time and only the
						// holder mutates the slots.
						let pushed = resv.shared.push(fence.get());
						if pushed.is_err() {
							error!("[resv] buffer {}: shared slots overflowed on commit", id);
						}
						debug_assert!(pushed.is_ok(), "shared fence slots overflowed on commit");
					}
					Access::Exclusive => {
						stale.extend(resv.shared.take_all());
						stale.extend(resv.excl.replace(fence.get()));
					}
				}
				resv.reserved = false;
				resv.ticket = None;
			}
			entry.reserved = false;
			entry.ticket = None;
			stale.extend(entry.fences.take_all());
		}

		self.wake_unreserved();
		drop(state);
		trace!("[resv] fence {} committed to {} buffers", fence.id(), list.len());
		drop(stale);
		Ok(())
	}

	/// Release the reservations `list` holds and reset its captures.
	/// Fences to release are moved into `stale` for dropping after unlock.
	fn backoff_locked(&self, state: &mut TableState, list: &mut [ValidateEntry], stale: &mut Vec<Fence>) {
		let mut released = 0;
		for entry in list.iter_mut() {
			if !ReservationTable::ptr_eq(entry.buf.table(), self) {
				continue;
			}
			stale.extend(entry.fences.take_all());
			let ticket = entry.ticket.take();
			if !entry.reserved {
				continue;
			}
			entry.reserved = false;
			if let Some(resv) = state.get_mut(entry.id()) {
				if resv.reserved && resv.ticket == ticket {
					resv.reserved = false;
					resv.ticket = None;
					released += 1;
				}
			}
		}
		if released > 0 {
			self.wake_unreserved();
		}
	}

	/// Sleep until `id` is unreserved.  Drops the table lock while asleep
	/// and always hands it back, along with the outcome.
	fn wait_unreserved<'a>(
		&'a self,
		mut state: MutexGuard<'a, TableState>,
		id: BufferId,
		mode: WaitMode,
	) -> (MutexGuard<'a, TableState>, Result) {
		loop {
			if !state.get(id).is_some_and(|r| r.reserved) {
				return (state, Ok(()));
			}
			let queue = self.unreserved_queue();
			let entry = queue.prepare();
			drop(state);

			let res = entry.sleep(mode, None);
			queue.finish(&entry);
			state = self.lock();
			if let Err(e) = res {
				return (state, Err(e));
			}
		}
	}
}

impl<const N: usize> FenceSlots<N> {
	/// Capture clones of `fences`.
	fn push_all<'f>(&mut self, fences: impl Iterator<Item = &'f Fence>) -> Result {
		for fence in fences {
			self.push(fence.get())?;
		}
		Ok(())
	}
}

/// Wait on the CPU for every fence captured in `list`.
///
/// Each fence gets [`CPU_WAIT_TIMEOUT`].  With `lazy` the thread sleeps in
/// the fence's own wait; without it, it polls with exponential spin
/// backoff, which reacts faster to completion at the cost of a busy core.
/// Stops at the first failure (`TimedOut`, or `Interrupted` in
/// interruptible mode).
pub fn wait_completed_cpu(list: &[ValidateEntry], mode: WaitMode, lazy: bool) -> Result {
	for entry in list {
		for fence in entry.fences() {
			let res = if lazy {
				fence.wait_timeout(mode, Some(CPU_WAIT_TIMEOUT)).map(|_| ())
			} else {
				poll_signaled(fence, mode)
			};
			if let Err(e) = res {
				debug!("[resv] cpu wait on fence {} for buffer {}: {}", fence.id(), entry.id(), e);
				return Err(e);
			}
		}
	}
	Ok(())
}

/// Spin iterations after which polling starts yielding the core.
const MAX_SPINS: u32 = 1 << 10;

fn poll_signaled(fence: &Fence, mode: WaitMode) -> Result {
	let deadline = Instant::now() + CPU_WAIT_TIMEOUT;
	let me = task::current();
	let mut spins = 1;
	loop {
		if fence.is_signaled() {
			return Ok(());
		}
		if mode == WaitMode::Interruptible && me.signal_pending() {
			return Err(Error::Interrupted);
		}
		if Instant::now() >= deadline {
			return Err(Error::TimedOut);
		}
		if spins < MAX_SPINS {
			for _ in 0..spins {
				hint::spin_loop();
			}
			spins *= 2;
		} else {
			thread::yield_now();
		}
	}
}
